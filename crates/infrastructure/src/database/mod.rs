pub mod device_repository;
pub mod schema_repository;

pub use device_repository::PostgresDeviceRepository;
pub use schema_repository::PostgresSchemaRepository;
