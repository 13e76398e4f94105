pub mod client;

pub use client::{ClientError, Reply, SmtpClient};
