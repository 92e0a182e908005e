//! Attribute validation and extended query tag value writing.

mod indexer;
mod validator;
mod value;

pub use indexer::{ExtendedTagIndexer, IndexReport};
pub use validator::{
    ValidationErrorCode, parse_dicom_date, parse_dicom_date_time, validate_attribute,
};
pub use value::{IndexValue, IndexedTagValue, person_name_words};
