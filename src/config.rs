//! Command-line surface: `argh` handles the process's one
//! named flag; the remainder is positional and *order-significant*, so it
//! is walked by hand the same way `original_source/luatt.py` walks
//! `sys.argv[2:]` rather than collected into an `argh` `Vec<String>`
//! positional, which would lose the distinction between "this came before
//! that" that `--mqtt=`, `-r`, `eval:`, and load targets all rely on.

use argh::FromArgs;
use tracing::warn;

/// Host-side bridge and multiplexer for the Lua microcontroller runtime.
#[derive(FromArgs)]
pub struct Cli {
    /// path to the character device or local attach socket to open
    #[argh(positional)]
    pub device: String,

    /// remaining arguments, processed in the order given: `--mqtt=host[:port]`,
    /// `-r`, `eval:EXPR`, or a load target (`*.lua`, `*.cmd`, `*.zip`, `*.luaz`)
    #[argh(positional)]
    pub rest: Vec<String>,
}

/// One parsed action from the CLI's order-significant remainder.
pub enum Action {
    Mqtt { host: String, port: u16 },
    Reset,
    Eval(String),
    Load(String),
}

/// Parse `rest` into an ordered list of actions. An argument that matches
/// none of the recognized forms is logged and skipped — the original
/// prints an error and keeps going rather than aborting the whole run.
pub fn parse_actions(rest: &[String]) -> Vec<Action> {
    let mut actions = Vec::with_capacity(rest.len());
    for arg in rest {
        if let Some(spec) = arg.strip_prefix("--mqtt=") {
            match spec.split_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => actions.push(Action::Mqtt {
                        host: host.to_string(),
                        port,
                    }),
                    Err(_) => warn!("bad command line arg {arg:?}: invalid port"),
                },
                None => actions.push(Action::Mqtt {
                    host: spec.to_string(),
                    port: 1883,
                }),
            }
        } else if arg == "-r" {
            actions.push(Action::Reset);
        } else if let Some(expr) = arg.strip_prefix("eval:") {
            actions.push(Action::Eval(expr.to_string()));
        } else if is_load_target(arg) {
            actions.push(Action::Load(arg.clone()));
        } else {
            warn!("bad command line arg {arg:?}");
        }
    }
    actions
}

fn is_load_target(arg: &str) -> bool {
    matches!(
        std::path::Path::new(arg)
            .extension()
            .and_then(|e| e.to_str()),
        Some("lua") | Some("cmd") | Some("zip") | Some("luaz")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mqtt_flag_defaults_port_to_1883() {
        let actions = parse_actions(&["--mqtt=192.168.1.1".to_string()]);
        assert!(matches!(
            actions.as_slice(),
            [Action::Mqtt { host, port: 1883 }] if host == "192.168.1.1"
        ));
    }

    #[test]
    fn mqtt_flag_parses_explicit_port() {
        let actions = parse_actions(&["--mqtt=host:8883".to_string()]);
        assert!(matches!(
            actions.as_slice(),
            [Action::Mqtt { host, port: 8883 }] if host == "host"
        ));
    }

    #[test]
    fn order_is_preserved_across_mixed_actions() {
        let actions = parse_actions(&[
            "-r".to_string(),
            "eval:1+1".to_string(),
            "foo.lua".to_string(),
        ]);
        assert!(matches!(actions[0], Action::Reset));
        assert!(matches!(&actions[1], Action::Eval(e) if e == "1+1"));
        assert!(matches!(&actions[2], Action::Load(p) if p == "foo.lua"));
    }

    #[test]
    fn unrecognized_arg_is_skipped_not_fatal() {
        let actions = parse_actions(&["garbage".to_string(), "-r".to_string()]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Reset));
    }
}
