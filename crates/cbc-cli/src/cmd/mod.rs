pub mod config;
pub mod definition;
pub mod init;
pub mod runs;
pub mod serve;
pub mod submit;
pub mod worker;
