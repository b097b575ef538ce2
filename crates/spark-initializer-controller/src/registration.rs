//! Registration lifecycle
//!
//! On startup the initializer makes sure the registration record lists it
//! exactly once; on shutdown the whole record is deleted.

use tracing::{info, warn};

use spark_initializer_common::metrics::record_registration;
use spark_initializer_common::{Error, InitializerConfig, Result};

use crate::client::ControlPlane;
use crate::resources::{Initializer, InitializerConfiguration};

/// Make sure the registration record contains this initializer.
///
/// Creates the record when it is missing and appends this initializer when
/// the record exists without it. Any failure is returned as
/// [`Error::Registration`] and is not retried.
pub async fn ensure_registered(
    control_plane: &dyn ControlPlane,
    config: &InitializerConfig,
) -> Result<()> {
    let name = &config.registration_name;
    let existing = control_plane
        .get_registration(name)
        .await
        .map_err(|e| Error::registration(name, format!("failed to get record: {}", e)))?;

    match existing {
        None => {
            let record = InitializerConfiguration::new(
                name.clone(),
                vec![Initializer::for_pods(config.initializer_name.clone())],
            );
            control_plane
                .create_registration(&record)
                .await
                .map_err(|e| Error::registration(name, format!("failed to create record: {}", e)))?;
            record_registration("created");
            info!(registration = %name, initializer = %config.initializer_name, "created registration");
        }
        Some(record) if record.contains(&config.initializer_name) => {
            record_registration("present");
            warn!(
                registration = %name,
                initializer = %config.initializer_name,
                "initializer already registered"
            );
        }
        Some(mut record) => {
            record
                .initializers
                .push(Initializer::for_pods(config.initializer_name.clone()));
            control_plane
                .update_registration(&record)
                .await
                .map_err(|e| Error::registration(name, format!("failed to update record: {}", e)))?;
            record_registration("appended");
            info!(registration = %name, initializer = %config.initializer_name, "added initializer to registration");
        }
    }

    Ok(())
}

/// Delete the registration record.
///
/// Every failure, including a record that is already gone, is returned as
/// [`Error::Registration`]; the caller decides whether it blocks exit.
pub async fn deregister(control_plane: &dyn ControlPlane, config: &InitializerConfig) -> Result<()> {
    let name = &config.registration_name;
    control_plane
        .delete_registration(name)
        .await
        .map_err(|e| Error::registration(name, format!("failed to delete record: {}", e)))?;
    record_registration("deleted");
    info!(registration = %name, "deleted registration");
    Ok(())
}
