use thiserror::Error;

#[derive(Error, Debug)]
pub enum KsError {
    #[error("Encoding error: {attribute:?}, value: {value:?}")]
    Encoding {
        attribute: &'static str,
        value: String,
    },
    #[error("Unknown operator: {0:?}")]
    UnknownOperator(String),
    #[error("Type mismatch: operator {operator:?} is not valid for argument type {arg_type:?}")]
    TypeMismatch { operator: String, arg_type: String },
    #[error("Table allocation failed for table {table_id}: {reason}")]
    TableAllocation { table_id: u32, reason: String },
    #[error("Publish failed for attachment {attachment:?}: {reason}")]
    Publish { attachment: String, reason: String },
    #[error("Reload already in flight for attachment {attachment:?}")]
    ConcurrentReload { attachment: String },
    #[error("Attachment {attachment:?}, selector {selector}: {source}")]
    Selector {
        attachment: String,
        selector: usize,
        #[source]
        source: Box<KsError>,
    },
    #[error("Invalid attribute: {attribute:?}, value: {value:?}")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
    #[error("Missing attribute: {0}")]
    MissingAttribute(String),
    #[error("Array limit reached: {attribute:?}, limit: {limit}")]
    ArrayLimitReached {
        attribute: &'static str,
        limit: usize,
    },
    #[error("Deserialize error: {0}")]
    Deserialize(String),
}
