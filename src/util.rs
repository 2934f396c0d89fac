pub mod callback;
pub mod safe_converter;
