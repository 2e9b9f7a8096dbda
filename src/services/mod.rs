pub mod blob_store;
pub mod credentials;
pub mod local_store;
pub mod sas;
pub mod storage_gateway;
