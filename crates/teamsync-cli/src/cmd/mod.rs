pub mod init;
pub mod serve;
pub mod sync;
pub mod validate;
