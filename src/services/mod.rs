pub mod abab_engine;
pub mod cache;
pub mod ingestor;
pub mod its_engine;
pub mod plots;
pub mod run_registry;
pub mod sced_standards;
pub mod validator;

pub use abab_engine::AbabRandomizationEngine;
pub use cache::ResponseCache;
pub use ingestor::AnalyticsStoreIngestor;
pub use its_engine::BayesianItsEngine;
pub use run_registry::RunRegistry;
pub use validator::EventValidator;
