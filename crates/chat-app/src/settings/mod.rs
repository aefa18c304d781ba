pub mod state;

pub use state::{
    BillingSettings, ExchangeSettings, ProviderSettings, SessionSettings, Settings, SettingsError,
    SettingsStore,
};
