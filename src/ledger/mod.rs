pub mod models;
pub mod repository;

pub use models::PaymentSource;
pub use repository::LedgerRepository;
