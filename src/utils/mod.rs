pub mod log_file;
pub mod sos;
