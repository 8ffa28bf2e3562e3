//! Tracing initialisation.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

static ATTEMPTED: OnceCell<()> = OnceCell::new();

/// Default directive added on top of `RUST_LOG`
pub const DEFAULT_DIRECTIVE: &str = "nexus_loop_bridge=info";

/// Install the global fmt subscriber.
///
/// Honours `RUST_LOG` and adds [`DEFAULT_DIRECTIVE`]. Returns `true` if this
/// call installed the subscriber; later calls (or a subscriber installed by
/// the embedding application) leave the existing one in place.
pub fn init() -> bool {
    init_with_directive(DEFAULT_DIRECTIVE)
}

/// Install the global fmt subscriber with a custom default directive.
///
/// Only the first call in the process attempts the install.
pub fn init_with_directive(directive: &str) -> bool {
    let mut installed = false;
    ATTEMPTED.get_or_init(|| {
        let mut filter = EnvFilter::from_default_env();
        if let Ok(parsed) = directive.parse::<Directive>() {
            filter = filter.add_directive(parsed);
        }
        installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok();
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init();
        assert!(first);
        assert!(!init_with_directive("nexus_loop_bridge=trace"));
        assert!(!init());
        tracing::info!("logging initialised");
    }
}
