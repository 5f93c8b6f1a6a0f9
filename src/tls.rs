//! Process-wide rustls setup.

use std::sync::Once;

static INSTALL: Once = Once::new();

/// Install aws-lc-rs as the process default crypto provider.
///
/// rustls refuses to pick a default when more than one provider is compiled
/// in, so this runs before any server configuration is built.
pub fn install_crypto_provider() {
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}
