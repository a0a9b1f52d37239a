//! Bootstrap payload preparation

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Commands added to every machine's cloud-config `runcmd` list
pub const EXTRA_RUNCMD: &[&str] = &["ufw disable"];

const RUNCMD_KEY: &str = "runcmd:";
const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Adds `commands` to the cloud-config `runcmd` section
///
/// Commands go right after the `runcmd:` key. Cloud-config without a
/// `runcmd` section gets one appended; non cloud-config payloads (shell
/// scripts, MIME archives) are returned unchanged.
pub fn inject_runcmd(user_data: &str, commands: &[&str]) -> String {
    let entries: String = commands.iter().map(|c| format!("\n  - {}", c)).collect();

    if let Some(pos) = user_data.find(RUNCMD_KEY) {
        let at = pos + RUNCMD_KEY.len();
        let mut out = String::with_capacity(user_data.len() + entries.len());
        out.push_str(&user_data[..at]);
        out.push_str(&entries);
        out.push_str(&user_data[at..]);
        return out;
    }

    if user_data.trim_start().starts_with(CLOUD_CONFIG_HEADER) {
        let mut out = user_data.trim_end_matches('\n').to_string();
        out.push('\n');
        out.push_str(RUNCMD_KEY);
        out.push_str(&entries);
        out.push('\n');
        return out;
    }

    user_data.to_string()
}

/// Final user data as sent to the provider
pub fn encode_user_data(bootstrap: &str) -> String {
    STANDARD.encode(inject_runcmd(bootstrap, EXTRA_RUNCMD))
}
