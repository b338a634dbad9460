//! Sea-ORM entities for the metadata tables

pub mod field;
pub mod ops;
pub mod reference;
pub mod table_meta;

// Re-export entities for convenience
pub use field::Entity as Field;
pub use ops::Entity as Ops;
pub use reference::Entity as Reference;
pub use table_meta::Entity as TableMeta;
