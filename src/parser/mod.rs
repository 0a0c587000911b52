//! Inbound parsing: header decoding, MIME extraction, subject cleaning and
//! envelope normalization.

pub mod header;
pub mod mime;
pub mod normalize;
pub mod subject;
