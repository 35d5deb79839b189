//! Read-only verification of recorded resources.
//!
//! Used when the change trigger decides a layer is unchanged: every recorded
//! handle is described at the provider, and anything that no longer answers is
//! reported. Drift is only ever warned about; it never causes a re-run.

use strata_runtime::{ResourceProvider, RuntimeError};
use strata_store::LayerState;
use tracing::warn;

/// Describe every resource in `state`, returning one warning per problem.
pub fn verify_resources(provider: &dyn ResourceProvider, state: &LayerState) -> Vec<String> {
    let mut warnings = Vec::new();
    for record in &state.resource_handles {
        let message = match provider.describe_resource(&record.handle) {
            Ok(_) => continue,
            Err(RuntimeError::ResourceNotFound(_)) => format!(
                "resource '{}' ({}) no longer exists at the provider",
                record.name, record.handle
            ),
            Err(e) => format!("could not describe resource '{}': {e}", record.name),
        };
        warn!("drift in {}/{}: {message}", state.environment, state.layer);
        warnings.push(message);
    }
    warnings
}
