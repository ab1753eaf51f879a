pub mod anonymizer;
pub mod bridge;
pub mod file_processor;
pub mod fpe;
pub mod record_source;
pub mod source_fs;
pub mod storage;
pub mod transform;
pub mod worker;
