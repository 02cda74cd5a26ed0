#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod http;
pub mod probe;
pub mod providers;
pub mod store;
pub mod website;

#[cfg(feature = "browser")]
pub use browser::{BrowserSession, BrowserSessionFactory};
pub use config::{RelaySources, RelaySourcesConfig};
pub use http::{HttpSession, HttpSessionFactory};
pub use probe::{HttpRelayProbe, ProbeConfig};
pub use providers::{GeonodeProvider, ProxyListProvider, StaticProvider, parse_relay_spec};
pub use store::JsonFileStore;
pub use website::{ListingCollector, SeedListCollector, WebsiteLeadExtractor};
