//! Operator alert channel.
//!
//! The recovery worker escalates here when an event exhausts its retry
//! budget. Implementations are fire-and-forget: they must never propagate
//! errors back into the caller's control flow.
//!
//! The reference implementation is log-based; SMS, email, chat, or
//! monitoring-system integrations slot in behind the same trait.

use async_trait::async_trait;
use tracing::{error, info, warn};

#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Notify operators of an error the system cannot resolve on its own.
    /// Immediate manual intervention is expected.
    async fn send_critical_alert(&self, title: &str, message: &str);

    /// Notify operators of a situation that needs attention.
    async fn send_warning_alert(&self, title: &str, message: &str) {
        let _ = (title, message);
    }

    /// Informational notification.
    async fn send_info_alert(&self, title: &str, message: &str) {
        let _ = (title, message);
    }
}

/// Log-based alert channel. Operators pick alerts up through log monitoring.
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn send_critical_alert(&self, title: &str, message: &str) {
        error!(alert = "critical", title = %title, "CRITICAL ALERT: {}", message);
        crate::metrics::record_alert("critical");
    }

    async fn send_warning_alert(&self, title: &str, message: &str) {
        warn!(alert = "warning", title = %title, "WARNING ALERT: {}", message);
        crate::metrics::record_alert("warning");
    }

    async fn send_info_alert(&self, title: &str, message: &str) {
        info!(alert = "info", title = %title, "INFO ALERT: {}", message);
        crate::metrics::record_alert("info");
    }
}
