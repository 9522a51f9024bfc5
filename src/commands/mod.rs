pub mod ingest;
pub mod inventory;
pub mod markets;
pub mod query;
pub mod status;
