pub mod changes;
pub mod critical;
pub mod metadata;
pub mod walker;
