#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ZapflowError {
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("invalid import: {0}")]
    InvalidImport(String),
}
