use anyhow::{Context, Result};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};

/// Parse a comma-separated GPU index list, e.g. `"0,1,3"`.
pub fn parse_gpu_indices(spec: &str) -> Result<Vec<u32>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("Invalid GPU index: {:?}", s))
        })
        .collect()
}

/// Rewrite the submitter's `+`-prefixed surface into standard flags.
///
/// In the original grammar only `+`-prefixed tokens are options, so command
/// tokens may start with `-` and a multi-token flag consumes values until
/// the next `+` token. That cannot be expressed directly with `-` flags, so
/// the multi-token flags (`++command`, `++labels`) are folded into `=`-form
/// here: `++command python train.py --epochs 2` becomes
/// `--command=python train.py --epochs 2` (one token). Every other `++x`
/// becomes `--x`, and `+n` becomes `-n`.
pub fn rewrite_plus_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        if arg == "++command" {
            let mut tokens = Vec::new();
            while let Some(token) = args.peek() {
                if token.starts_with('+') {
                    break;
                }
                tokens.push(args.next().unwrap_or_default());
            }
            out.push(format!("--command={}", tokens.join(" ")));
        } else if arg == "++labels" {
            while let Some(token) = args.peek() {
                if token.starts_with('+') {
                    break;
                }
                out.push(format!("--labels={}", args.next().unwrap_or_default()));
            }
        } else if let Some(rest) = arg.strip_prefix("++") {
            out.push(format!("--{}", rest));
        } else if arg == "+n" {
            out.push("-n".to_string());
        } else {
            out.push(arg);
        }
    }
    out
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_indices_parse() {
        assert_eq!(parse_gpu_indices("0,1,3").unwrap(), vec![0, 1, 3]);
        assert_eq!(parse_gpu_indices("2").unwrap(), vec![2]);
        assert_eq!(parse_gpu_indices("").unwrap(), Vec::<u32>::new());
        assert!(parse_gpu_indices("0,x").is_err());
    }

    #[test]
    fn plus_args_are_rewritten() {
        let argv = ["qpush", "++command", "python", "train.py", "+n", "++num-gpu", "2"]
            .into_iter()
            .map(String::from);
        assert_eq!(
            rewrite_plus_args(argv),
            vec!["qpush", "--command=python train.py", "-n", "--num-gpu", "2"]
        );
    }

    #[test]
    fn command_keeps_its_own_flags() {
        let argv = [
            "qpush",
            "++command",
            "python",
            "train.py",
            "--epochs",
            "50",
            "++repo-url",
            "https://x/y.git",
        ]
        .into_iter()
        .map(String::from);
        assert_eq!(
            rewrite_plus_args(argv),
            vec![
                "qpush",
                "--command=python train.py --epochs 50",
                "--repo-url",
                "https://x/y.git"
            ]
        );
    }

    #[test]
    fn labels_expand_to_repeated_flags() {
        let argv = ["qpush", "++labels", "a", "b", "++priority", "7"]
            .into_iter()
            .map(String::from);
        assert_eq!(
            rewrite_plus_args(argv),
            vec!["qpush", "--labels=a", "--labels=b", "--priority", "7"]
        );
    }

    #[test]
    fn plain_tokens_pass_through() {
        let argv = ["a+b", "-x", "--y", "+nn"].into_iter().map(String::from);
        assert_eq!(rewrite_plus_args(argv), vec!["a+b", "-x", "--y", "+nn"]);
    }
}
