//! Fallback hook for unhandled panics
//!
//! Backend calls report their errors to the circuit breaker at the call
//! site. This hook only covers panics nobody caught: it extracts the panic
//! message, forwards it to the breaker's classifier and then hands off to
//! whatever hook was installed before.
//!
//! # Usage
//!
//! ```no_run
//! use tether_core::resilience::install_panic_hook;
//! # fn demo(engine: &tether_core::ResilienceEngine) {
//! install_panic_hook(engine.breaker().clone());
//! # }
//! ```

use super::circuit_breaker::{BreakerVerdict, ErrorCircuitBreaker};
use std::any::Any;
use std::panic;
use tracing::error;

/// Install the forwarding hook
///
/// The previous hook always runs afterwards, so backtraces and test-harness
/// output are unaffected.
pub fn install_panic_hook(breaker: ErrorCircuitBreaker) {
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());

        let verdict = breaker.record_message(&message);
        if verdict != BreakerVerdict::Ignored {
            error!(
                location = %location,
                message = %message,
                verdict = ?verdict,
                "Unhandled backend-internal panic"
            );
        }

        previous(info);
    }));

    tracing::info!("Panic hook installed, fatal panics feed the circuit breaker");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<no message>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::monitoring::MetricsRegistry;

    #[test]
    fn test_fatal_panic_is_counted() {
        let breaker =
            ErrorCircuitBreaker::new(BreakerConfig::default(), MetricsRegistry::new().unwrap());
        install_panic_hook(breaker.clone());

        let _ = std::thread::spawn(|| {
            panic!("INTERNAL ASSERTION FAILED: Unexpected state (ID: ca9)");
        })
        .join();
        let _ = std::thread::spawn(|| {
            panic!("index out of bounds");
        })
        .join();

        // Restore the default hook for the rest of the test binary
        let _ = panic::take_hook();

        assert_eq!(breaker.consecutive_count(), 1);
    }
}
