pub mod db;
pub mod digest;
