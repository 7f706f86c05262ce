use crate::model::Profile;
use crate::provisioning::{endpoint_for_coverage, validate_profile};
use anyhow::Result;
use dialoguer::{Input, Password, Select};

const COVERAGES: [(&str, &str); 2] = [("Japan", "jp"), ("Global", "g")];

/// Asks for the coverage type and the key pair on the terminal.
pub fn prompt_profile(default_coverage: &str) -> Result<Profile> {
    let items: Vec<&str> = COVERAGES.iter().map(|(label, _)| *label).collect();
    let default = COVERAGES
        .iter()
        .position(|(_, coverage)| *coverage == default_coverage)
        .unwrap_or(0);
    let selection = Select::new()
        .with_prompt("Coverage type")
        .items(&items)
        .default(default)
        .interact()?;
    let auth_key_id: String = Input::new()
        .with_prompt("AuthKeyId (keyId-...)")
        .interact_text()?;
    let auth_key = Password::new()
        .with_prompt("AuthKey (secret-...)")
        .interact()?;

    let coverage = COVERAGES.get(selection).map_or("jp", |(_, coverage)| *coverage);
    profile_from_answers(coverage, &auth_key_id, &auth_key)
}

fn profile_from_answers(coverage: &str, auth_key_id: &str, auth_key: &str) -> Result<Profile> {
    let profile = Profile {
        auth_key: auth_key.trim().to_string(),
        auth_key_id: auth_key_id.trim().to_string(),
        endpoint: endpoint_for_coverage(coverage).to_string(),
    };
    validate_profile(&profile)?;
    Ok(profile)
}
