use std::env;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Runtime configuration for a bulk import run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Link recurring donations to the contact instead of the account.
    pub enhanced_recurring_donations: bool,
    /// Length of the short id form that aliases a full store id.
    pub id_prefix_len: usize,
    /// Highest `Organization N` column group read from a row.
    pub organization_slots: usize,
    /// Highest `Contact Campaign N` / `Account Campaign N` column group read from a row.
    pub campaign_slots: usize,
    pub donation_name_max_len: usize,
    pub default_stage_name: String,
    pub household_suffix: String,
    pub email_opt_in_field: Option<String>,
    pub email_opt_out_field: Option<String>,
    pub sms_opt_in_field: Option<String>,
    pub sms_opt_out_field: Option<String>,
    pub progress_log_interval: usize,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            enhanced_recurring_donations: env_bool("IMPORT_ENHANCED_RECURRING_DONATIONS", false),
            id_prefix_len: env_usize("IMPORT_ID_PREFIX_LEN", 15),
            organization_slots: env_usize("IMPORT_ORGANIZATION_SLOTS", 5),
            campaign_slots: env_usize("IMPORT_CAMPAIGN_SLOTS", 5),
            donation_name_max_len: env_usize("IMPORT_DONATION_NAME_MAX_LEN", 120),
            default_stage_name: env_string("IMPORT_DEFAULT_STAGE_NAME", "Closed Won"),
            household_suffix: env_string("IMPORT_HOUSEHOLD_SUFFIX", " Household"),
            email_opt_in_field: env_optional("IMPORT_EMAIL_OPT_IN_FIELD"),
            email_opt_out_field: env_optional("IMPORT_EMAIL_OPT_OUT_FIELD"),
            sms_opt_in_field: env_optional("IMPORT_SMS_OPT_IN_FIELD"),
            sms_opt_out_field: env_optional("IMPORT_SMS_OPT_OUT_FIELD"),
            progress_log_interval: env_usize("IMPORT_PROGRESS_LOG_INTERVAL", 100).max(1),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
