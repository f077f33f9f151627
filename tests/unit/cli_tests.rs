//! Unit tests for command-line parsing.

use clap::error::ErrorKind;
use clap::Parser;

use stdio_bridge::cli::Cli;

#[test]
fn target_and_default_port() {
    let cli = Cli::try_parse_from(["stdio-bridge", "--target", "tools"]).expect("valid");

    assert_eq!(cli.target, "tools");
    assert_eq!(cli.port, 11434);
}

#[test]
fn container_is_an_alias_for_target() {
    let cli = Cli::try_parse_from(["stdio-bridge", "--container", "mcp-fs", "--port", "9000"])
        .expect("valid");

    assert_eq!(cli.target, "mcp-fs");
    assert_eq!(cli.port, 9000);
}

#[test]
fn missing_target_is_a_usage_error() {
    let err = Cli::try_parse_from(["stdio-bridge"]).expect_err("target is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn invalid_port_is_a_usage_error() {
    for port in ["abc", "70000", "-1"] {
        let result = Cli::try_parse_from(["stdio-bridge", "--target", "tools", "--port", port]);
        assert!(result.is_err(), "port {port} must be rejected");
    }
}

#[test]
fn unknown_flag_is_rejected() {
    let err = Cli::try_parse_from(["stdio-bridge", "--target", "tools", "--verbose"])
        .expect_err("no other flags");
    assert_eq!(err.kind(), ErrorKind::UnknownArgument);
}
