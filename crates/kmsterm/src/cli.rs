#![forbid(unsafe_code)]

//! Command-line options.
//!
//! Parses args manually (no external dependencies) to keep the binary lean.
//! `KMSTERM_*` environment overrides are applied first, then flags. The
//! first token that is not an option starts the child command line.

use std::env;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
kmsterm: a terminal emulator for the bare Linux console

USAGE:
    kmsterm [OPTIONS] [PROGRAM [ARGS...]]

OPTIONS:
    --tty=N              Run on VT N; accepts 3, tty3, or /dev/tty3
                         (default: the active VT)
    --activate           Switch to the target VT before starting
    --card=N             Use display adapter N; accepts 0, card0, or
                         /dev/dri/card0 (default: first present node)
    --dpi=N              Override the DPI derived from the display
    --font=PATH          Monospace font file (default: search well-known paths)
    --font-size=PT       Font size in points (default: 20)
    --mouse-speed=F      Pointer sensitivity multiplier (default: 1)
    --help, -h           Show this help message
    --version, -V        Show version

The trailing PROGRAM runs inside the terminal (default: /bin/login).

ENVIRONMENT VARIABLES:
    KMSTERM_TTY          Override --tty
    KMSTERM_ACTIVATE     Override --activate (1 or true)
    KMSTERM_CARD         Override --card
    KMSTERM_DPI          Override --dpi
    KMSTERM_FONT         Override --font
    KMSTERM_FONT_SIZE    Override --font-size
    KMSTERM_MOUSE_SPEED  Override --mouse-speed
    RUST_LOG             Log filter written to stderr (default: info)";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq)]
pub struct Opts {
    /// VT to run on; `None` means the currently active one.
    pub tty: Option<u16>,
    /// Switch to the target VT before starting.
    pub activate: bool,
    /// Display adapter number; `None` scans for the first present node.
    pub card: Option<u32>,
    /// DPI override; `None` derives it from the display's physical size.
    pub dpi: Option<u32>,
    /// Font file; `None` searches a fixed list of well-known paths.
    pub font: Option<PathBuf>,
    /// Font size in points.
    pub font_size: f32,
    /// Pointer sensitivity multiplier.
    pub mouse_speed: f32,
    /// Program to run inside the terminal.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            tty: None,
            activate: false,
            card: None,
            dpi: None,
            font: None,
            font_size: 20.0,
            mouse_speed: 1.0,
            program: "/bin/login".into(),
            args: Vec::new(),
        }
    }
}

/// What a successful argument scan asks for.
#[derive(Debug, PartialEq)]
enum Parsed {
    Run(Opts),
    Help,
    Version,
}

impl Opts {
    /// Parse environment overrides and command-line arguments.
    ///
    /// `--help` and `--version` print and exit 0; anything invalid prints
    /// one line to stderr and exits 1.
    pub fn parse() -> Self {
        let mut opts = Self::default();
        opts.apply_env();
        match parse_args(opts, env::args().skip(1)) {
            Ok(Parsed::Run(opts)) => opts,
            Ok(Parsed::Help) => {
                println!("{HELP_TEXT}");
                process::exit(0);
            }
            Ok(Parsed::Version) => {
                println!("kmsterm {VERSION}");
                process::exit(0);
            }
            Err(message) => {
                eprintln!("{message}");
                eprintln!("Run with --help for usage information.");
                process::exit(1);
            }
        }
    }

    /// Apply `KMSTERM_*` overrides. They take precedence over defaults but
    /// are themselves overridden by explicit flags; unparseable values are
    /// ignored.
    fn apply_env(&mut self) {
        if let Ok(val) = env::var("KMSTERM_TTY")
            && let Ok(n) = vt_number(&val)
        {
            self.tty = Some(n);
        }
        if let Ok(val) = env::var("KMSTERM_ACTIVATE") {
            self.activate = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = env::var("KMSTERM_CARD")
            && let Ok(n) = card_number(&val)
        {
            self.card = Some(n);
        }
        if let Ok(val) = env::var("KMSTERM_DPI")
            && let Ok(n) = val.parse()
        {
            self.dpi = Some(n);
        }
        if let Ok(val) = env::var("KMSTERM_FONT") {
            self.font = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("KMSTERM_FONT_SIZE")
            && let Ok(n) = val.parse()
        {
            self.font_size = n;
        }
        if let Ok(val) = env::var("KMSTERM_MOUSE_SPEED")
            && let Ok(n) = val.parse()
        {
            self.mouse_speed = n;
        }
    }
}

/// Scan argument tokens into `opts`.
///
/// Flags accept both `--flag=value` and `--flag value`. Tokens after the
/// child program are passed through untouched, so `kmsterm sh -c ls` works
/// without an end-of-options marker.
fn parse_args<I>(mut opts: Opts, args: I) -> Result<Parsed, String>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        match flag {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            "--activate" => opts.activate = true,
            "--tty" => {
                let value = take_value(&args, &mut i, inline, "--tty")?;
                opts.tty = Some(vt_number(&value)?);
            }
            "--card" => {
                let value = take_value(&args, &mut i, inline, "--card")?;
                opts.card = Some(card_number(&value)?);
            }
            "--dpi" => {
                let value = take_value(&args, &mut i, inline, "--dpi")?;
                opts.dpi = Some(numeric(&value, "--dpi")?);
            }
            "--font" => {
                let value = take_value(&args, &mut i, inline, "--font")?;
                opts.font = Some(PathBuf::from(value));
            }
            "--font-size" => {
                let value = take_value(&args, &mut i, inline, "--font-size")?;
                opts.font_size = numeric(&value, "--font-size")?;
            }
            "--mouse-speed" => {
                let value = take_value(&args, &mut i, inline, "--mouse-speed")?;
                opts.mouse_speed = numeric(&value, "--mouse-speed")?;
            }
            _ if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            _ => {
                opts.program = arg.clone();
                opts.args = args[i + 1..].to_vec();
                break;
            }
        }
        i += 1;
    }
    Ok(Parsed::Run(opts))
}

/// Pull a flag's value from its `=` form or the next token.
fn take_value(
    args: &[String],
    i: &mut usize,
    inline: Option<String>,
    flag: &str,
) -> Result<String, String> {
    if let Some(value) = inline {
        return Ok(value);
    }
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn numeric<T: FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid {flag} value: {value}"))
}

/// Accept a bare VT number, a device name, or a full device path.
fn vt_number(value: &str) -> Result<u16, String> {
    let digits = value
        .strip_prefix("/dev/tty")
        .or_else(|| value.strip_prefix("tty"))
        .unwrap_or(value);
    digits.parse().map_err(|_| format!("invalid tty: {value}"))
}

/// Accept a bare adapter number, a device name, or a full device path.
fn card_number(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("/dev/dri/card")
        .or_else(|| value.strip_prefix("card"))
        .unwrap_or(value);
    digits.parse().map_err(|_| format!("invalid card: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(tokens: &[&str]) -> Result<Parsed, String> {
        parse_args(Opts::default(), tokens.iter().map(|t| t.to_string()))
    }

    fn run(tokens: &[&str]) -> Opts {
        match scan(tokens) {
            Ok(Parsed::Run(opts)) => opts,
            other => panic!("expected parsed options, got {other:?}"),
        }
    }

    #[test]
    fn default_opts() {
        let opts = Opts::default();
        assert_eq!(opts.tty, None);
        assert!(!opts.activate);
        assert_eq!(opts.card, None);
        assert_eq!(opts.dpi, None);
        assert_eq!(opts.font, None);
        assert_eq!(opts.font_size, 20.0);
        assert_eq!(opts.mouse_speed, 1.0);
        assert_eq!(opts.program, "/bin/login");
        assert!(opts.args.is_empty());
    }

    #[test]
    fn no_arguments_runs_defaults() {
        assert_eq!(run(&[]), Opts::default());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert_eq!(scan(&["--help"]), Ok(Parsed::Help));
        assert_eq!(scan(&["-h"]), Ok(Parsed::Help));
        assert_eq!(scan(&["--version"]), Ok(Parsed::Version));
        assert_eq!(scan(&["-V"]), Ok(Parsed::Version));
        // Short-circuits even after other flags.
        assert_eq!(scan(&["--activate", "--help"]), Ok(Parsed::Help));
    }

    #[test]
    fn tty_accepts_number_name_and_path() {
        assert_eq!(run(&["--tty=3"]).tty, Some(3));
        assert_eq!(run(&["--tty", "3"]).tty, Some(3));
        assert_eq!(run(&["--tty=tty3"]).tty, Some(3));
        assert_eq!(run(&["--tty=/dev/tty3"]).tty, Some(3));
    }

    #[test]
    fn card_accepts_number_name_and_path() {
        assert_eq!(run(&["--card=1"]).card, Some(1));
        assert_eq!(run(&["--card=card1"]).card, Some(1));
        assert_eq!(run(&["--card=/dev/dri/card1"]).card, Some(1));
    }

    #[test]
    fn flag_values_parse() {
        let opts = run(&[
            "--activate",
            "--dpi=144",
            "--font=/tmp/mono.ttf",
            "--font-size=14.5",
            "--mouse-speed=2.5",
        ]);
        assert!(opts.activate);
        assert_eq!(opts.dpi, Some(144));
        assert_eq!(opts.font, Some(PathBuf::from("/tmp/mono.ttf")));
        assert_eq!(opts.font_size, 14.5);
        assert_eq!(opts.mouse_speed, 2.5);
    }

    #[test]
    fn first_positional_starts_child_command() {
        let opts = run(&["--activate", "sh", "-c", "ls"]);
        assert!(opts.activate);
        assert_eq!(opts.program, "sh");
        // Tokens after the program are never parsed as kmsterm flags.
        assert_eq!(opts.args, vec!["-c".to_string(), "ls".to_string()]);
    }

    #[test]
    fn positional_with_equals_is_not_a_flag() {
        let opts = run(&["env", "FOO=bar", "true"]);
        assert_eq!(opts.program, "env");
        assert_eq!(opts.args, vec!["FOO=bar".to_string(), "true".to_string()]);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = scan(&["--frobnicate"]).unwrap_err();
        assert!(err.contains("--frobnicate"), "{err}");
    }

    #[test]
    fn missing_value_is_rejected() {
        let err = scan(&["--tty"]).unwrap_err();
        assert!(err.contains("missing value"), "{err}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(scan(&["--tty=zero"]).is_err());
        assert!(scan(&["--dpi=high"]).is_err());
        assert!(scan(&["--font-size=big"]).is_err());
    }

    #[test]
    fn version_string_nonempty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn help_text_lists_every_option_and_env_var() {
        for needle in [
            "--tty", "--activate", "--card", "--dpi", "--font", "--font-size", "--mouse-speed",
        ] {
            assert!(HELP_TEXT.contains(needle), "missing {needle}");
        }
        for needle in [
            "KMSTERM_TTY",
            "KMSTERM_ACTIVATE",
            "KMSTERM_CARD",
            "KMSTERM_DPI",
            "KMSTERM_FONT",
            "KMSTERM_FONT_SIZE",
            "KMSTERM_MOUSE_SPEED",
        ] {
            assert!(HELP_TEXT.contains(needle), "missing {needle}");
        }
    }
}
