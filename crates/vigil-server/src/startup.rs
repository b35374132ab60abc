//! Server startup utilities.

use tracing::info;
use vigil_config::AppConfig;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
        _       _ __
 _   __(_)___ _(_) /
| | / / / __ `/ / /
| |/ / / /_/ / / /
|___/_/\__, /_/_/
      /____/   discovery & compliance scheduler
    "#);
}

/// Prints the effective scheduling settings.
pub fn print_startup_info(instance_id: &str, config: &AppConfig) {
    let separator = "=".repeat(60);
    let scheduler = &config.scheduler;
    info!("{}", separator);
    info!("Instance:      {}", instance_id);
    info!("Environment:   {}", config.app.environment);
    info!("Metrics:       http://{}/metrics", config.telemetry.metrics_addr);
    info!(
        "Describe:      create every {}s, dispatch every {}s, rediscover after {}h",
        scheduler.create_interval_secs, scheduler.dispatch_interval_secs, scheduler.describe_interval_hours
    );
    info!(
        "Admission:     max queued {}, max per 10 minutes {}, default type ceiling {}",
        scheduler.max_queued, scheduler.max_in_10_minutes, scheduler.default_resource_type_limit
    );
    info!("Runners:       publish on '{}'", config.compliance.publish_schedule);
    info!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_banner_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_banner();
    }

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_startup_info("scheduler-test", &AppConfig::default());
    }
}
