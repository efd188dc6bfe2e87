pub mod auditor;
pub mod ledger;
pub mod record;
pub mod storage;
