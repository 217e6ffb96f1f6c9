use once_cell::sync::Lazy;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP listener binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP listener binds to. Defaults to `8080`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080)
});

/// Allow startup to continue when migrations fail (local development only).
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

/// Seconds a planned run may wait for confirmation before it times out.
pub static CONFIRMATION_TIMEOUT_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("CONFIRMATION_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(24 * 60 * 60)
});

/// Interval between expiry sweeper ticks.
pub static SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(60)
});

/// Days of policy evaluation history kept before the sweeper prunes rows.
pub static EVALUATION_RETENTION_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("EVALUATION_RETENTION_DAYS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(90)
});

/// Explicit gate for the destructive reset-all-data test hook.
pub static ENABLE_TEST_RESET: Lazy<bool> = Lazy::new(|| {
    std::env::var("ENABLE_TEST_RESET")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});
