pub mod commit;
pub mod signature;
