//! Unit tests for `AppError` display format and conversions.

use stdio_bridge::AppError;

#[test]
fn every_variant_has_a_distinct_lowercase_prefix() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Spawn("x".into()), "spawn: x"),
        (AppError::Transport("x".into()), "transport: x"),
        (AppError::ConnectionClosed("x".into()), "connection closed: x"),
        (AppError::Timeout("x".into()), "timeout: x"),
        (AppError::QueueFull("x".into()), "queue full: x"),
        (AppError::InvalidRequest("x".into()), "invalid request: x"),
        (AppError::Protocol("x".into()), "protocol: x"),
        (AppError::Io("x".into()), "io: x"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn error_message_has_no_trailing_period() {
    let err = AppError::Timeout("no response for request 1 within 30s".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn only_timeout_reports_is_timeout() {
    assert!(AppError::Timeout("t".into()).is_timeout());
    assert!(!AppError::Transport("t".into()).is_timeout());
    assert!(!AppError::ConnectionClosed("t".into()).is_timeout());
}

#[test]
fn json_error_becomes_invalid_request() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").expect_err("invalid");
    let err = AppError::from(json_err);

    assert!(matches!(err, AppError::InvalidRequest(_)));
    assert!(err.to_string().starts_with("invalid request: malformed json"));
}

#[test]
fn io_error_becomes_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = AppError::from(io_err);

    assert_eq!(err, AppError::Io("pipe closed".into()));
}

#[test]
fn errors_clone_for_fan_out() {
    let err = AppError::ConnectionClosed("tool process exited with code 1".into());
    let copies: Vec<AppError> = (0..3).map(|_| err.clone()).collect();

    assert!(copies.iter().all(|c| *c == err));
}
