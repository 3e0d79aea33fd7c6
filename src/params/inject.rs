use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use crate::collab::CiHost;
use crate::params::schema::ParamSchema;

/// Whether the build's parameter declaration has to be replaced: true when
/// any schema parameter is not declared on the current build.
pub fn needs_update(schema: &[ParamSchema], current: &BTreeMap<String, String>) -> bool {
    schema.iter().any(|p| !current.contains_key(&p.name))
}

/// Install the validated schema as the build's parameter declaration and
/// rename the build so the operator sees why it stopped. The caller
/// terminates the run with the neutral PARAMETERS_UPDATED result. In
/// dry-run the installation is skipped but the rename still happens.
pub async fn inject(host: &dyn CiHost, schema: &[ParamSchema], dry_run: bool) -> Result<()> {
    if dry_run {
        info!(
            parameters = schema.len(),
            "Dry-run: skipping parameter declaration install"
        );
    } else {
        host.install_parameters(schema).await?;
    }
    host.rename_build("parameters updated").await?;
    info!("Build parameters were updated from the settings file; re-build to use them.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::schema::builtin_parameters;

    fn current(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), String::new()))
            .collect()
    }

    #[test]
    fn update_needed_when_any_name_is_missing() {
        let schema = builtin_parameters();
        assert!(needs_update(&schema, &current(&["DRY_RUN"])));
    }

    #[test]
    fn no_update_when_all_names_declared() {
        let schema = builtin_parameters();
        let names: Vec<&str> = schema.iter().map(|p| p.name.as_str()).collect();
        assert!(!needs_update(&schema, &current(&names)));
    }
}
