// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports sync, status, export, and init-schema commands

pub mod export;
pub mod init_schema;
pub mod status;
pub mod sync;

pub use export::export;
pub use init_schema::init_schema;
pub use status::status;
pub use sync::sync;
