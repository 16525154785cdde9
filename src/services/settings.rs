use crate::client::{FeederApi, FeederClientError};
use crate::models::feeder::Settings;
use crate::notify::Channel;
use log::{info, warn};

/// Cached device settings; replaced wholesale on fetch and on confirmed save.
pub struct SettingsStore {
    current: Option<Settings>,
    channel: Channel<Settings>,
    fetching: Channel<bool>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        SettingsStore {
            current: None,
            channel: Channel::replaying("settings"),
            fetching: Channel::with_initial("settings.fetching", false),
        }
    }

    pub fn current(&self) -> Option<&Settings> {
        self.current.as_ref()
    }

    pub fn channel(&self) -> &Channel<Settings> {
        &self.channel
    }

    pub fn fetching(&self) -> &Channel<bool> {
        &self.fetching
    }

    pub fn fetch(&mut self, api: &dyn FeederApi) -> Result<(), FeederClientError> {
        self.fetching.publish(true);
        let result = api.get_settings();
        self.fetching.publish(false);

        let settings = result.inspect_err(|e| warn!("Fetching settings failed: {}", e))?;
        info!("Fetched settings (pet={})", settings.pet_name.as_deref().unwrap_or("-"));
        self.replace(settings);
        Ok(())
    }

    pub fn save(&mut self, api: &dyn FeederApi, settings: Settings) -> Result<(), FeederClientError> {
        api.update_settings(&settings)
            .inspect_err(|e| warn!("Saving settings failed: {}", e))?;
        info!("Settings saved");
        self.replace(settings);
        Ok(())
    }

    fn replace(&mut self, settings: Settings) {
        self.current = Some(settings.clone());
        self.channel.publish(settings);
    }
}
