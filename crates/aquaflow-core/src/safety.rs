/// Limits on how far and how fast a control may move an actuator setting.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    pub min_setting: f64,
    pub max_setting: f64,
    pub max_delta_per_hour: f64,
    /// Seconds that must pass between two changes.
    pub min_update_interval: u64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            min_setting: 0.0,
            max_setting: 1.0,
            max_delta_per_hour: 0.5,
            min_update_interval: 900, // 15 min
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingEnvelope {
    pub cfg: EnvelopeConfig,
    last_change_time: Option<u64>,
    last_setting: Option<f64>,
}

impl SettingEnvelope {
    pub fn new(cfg: EnvelopeConfig) -> Self {
        Self { cfg, last_change_time: None, last_setting: None }
    }

    pub fn last_setting(&self) -> Option<f64> {
        self.last_setting
    }

    /// Returns true if `proposed` may be applied at `t` as is.
    pub fn allow_change(&self, t: u64, proposed: f64) -> bool {
        if !proposed.is_finite() { return false; }
        if proposed < self.cfg.min_setting || proposed > self.cfg.max_setting { return false; }
        if let Some(last_t) = self.last_change_time {
            let elapsed = t.saturating_sub(last_t);
            if elapsed < self.cfg.min_update_interval { return false; }
            if let Some(last) = self.last_setting {
                let allowed = self.cfg.max_delta_per_hour * (elapsed as f64 / 3_600.0);
                if (proposed - last).abs() > allowed + f64::EPSILON { return false; }
            }
        }
        true
    }

    /// The closest setting to `proposed` that the envelope permits at `t`, or
    /// `None` while the update interval has not elapsed.
    pub fn limit(&self, t: u64, proposed: f64) -> Option<f64> {
        if !proposed.is_finite() { return None; }
        let mut target = proposed.clamp(self.cfg.min_setting, self.cfg.max_setting);
        if let Some(last_t) = self.last_change_time {
            let elapsed = t.saturating_sub(last_t);
            if elapsed < self.cfg.min_update_interval { return None; }
            if let Some(last) = self.last_setting {
                let allowed = self.cfg.max_delta_per_hour * (elapsed as f64 / 3_600.0);
                target = target.clamp(last - allowed, last + allowed);
            }
        }
        Some(target)
    }

    pub fn record_change(&mut self, t: u64, setting: f64) {
        self.last_change_time = Some(t);
        self.last_setting = Some(setting);
    }
}
