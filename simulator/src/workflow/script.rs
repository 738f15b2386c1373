use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use gammacore::spectrum::MarkerKind;

/// One line of a batch script.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `spectrum get <path>` loads a spectrum written as JSON.
    SpectrumGet(PathBuf),
    /// `spectrum activate <id>`
    SpectrumActivate(usize),
    /// `spectrum calbin <id> [-b <binsize>]`
    SpectrumCalbin { id: usize, binsize: Option<f64> },
    /// `calibration position set <c0> <c1> ...` on the active spectrum.
    CalibrationSet(Vec<f64>),
    /// `fit marker <kind> set <channel>`
    MarkerSet { kind: MarkerKind, channel: f64 },
    /// `fit marker <kind> clear`
    MarkerClear(MarkerKind),
    FitExecute,
    FitStore,
    /// `fit clear` drops every active marker.
    FitClear,
    /// `fitlist write <path>`
    FitlistWrite(PathBuf),
    /// `fitlist read [-r] <path>`, `-r` refits every stored fit.
    FitlistRead { path: PathBuf, refit: bool },
}

/// Parses a whole script. Blank lines and `#` comments are skipped; errors
/// name the offending line.
pub fn parse_script(text: &str) -> anyhow::Result<Vec<Command>> {
    text.lines()
        .enumerate()
        .filter_map(|(number, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then_some((number + 1, line))
        })
        .map(|(number, line)| {
            parse_command(line).with_context(|| format!("line {}: `{}`", number, line))
        })
        .collect()
}

pub fn parse_command(line: &str) -> anyhow::Result<Command> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["spectrum", "get", path] => Ok(Command::SpectrumGet(PathBuf::from(path))),
        ["spectrum", "activate", id] => Ok(Command::SpectrumActivate(parse_number(id)?)),
        ["spectrum", "calbin", id] => Ok(Command::SpectrumCalbin {
            id: parse_number(id)?,
            binsize: None,
        }),
        ["spectrum", "calbin", id, "-b", binsize] => Ok(Command::SpectrumCalbin {
            id: parse_number(id)?,
            binsize: Some(parse_number(binsize)?),
        }),
        ["calibration", "position", "set", coefficients @ ..] if !coefficients.is_empty() => {
            let coefficients = coefficients
                .iter()
                .map(|c| parse_number(c))
                .collect::<anyhow::Result<Vec<f64>>>()?;
            Ok(Command::CalibrationSet(coefficients))
        }
        ["fit", "marker", kind, "set", channel] => Ok(Command::MarkerSet {
            kind: parse_marker_kind(kind)?,
            channel: parse_number(channel)?,
        }),
        ["fit", "marker", kind, "clear"] => Ok(Command::MarkerClear(parse_marker_kind(kind)?)),
        ["fit", "execute"] => Ok(Command::FitExecute),
        ["fit", "store"] => Ok(Command::FitStore),
        ["fit", "clear"] => Ok(Command::FitClear),
        ["fitlist", "write", path] => Ok(Command::FitlistWrite(PathBuf::from(path))),
        ["fitlist", "read", path] => Ok(Command::FitlistRead {
            path: PathBuf::from(path),
            refit: false,
        }),
        ["fitlist", "read", "-r", path] => Ok(Command::FitlistRead {
            path: PathBuf::from(path),
            refit: true,
        }),
        _ => bail!("unknown command"),
    }
}

fn parse_marker_kind(word: &str) -> anyhow::Result<MarkerKind> {
    match word {
        "background" | "bg" => Ok(MarkerKind::Background),
        "region" => Ok(MarkerKind::Region),
        "peak" => Ok(MarkerKind::Peak),
        other => Err(anyhow!("unknown marker kind `{}`", other)),
    }
}

fn parse_number<T>(word: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    word.parse::<T>()
        .with_context(|| format!("invalid number `{}`", word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calbin_workflow() {
        let script = "\
# initial fit
fit marker bg set 1050
fit marker region set 1235.5
fit marker peak set 1250

fit execute
fit store   # keep it
spectrum calbin 0
spectrum calbin 0 -b 2
fitlist read -r fits.json
";
        let commands = parse_script(script).unwrap();
        assert_eq!(
            commands,
            vec![
                Command::MarkerSet {
                    kind: MarkerKind::Background,
                    channel: 1050.0
                },
                Command::MarkerSet {
                    kind: MarkerKind::Region,
                    channel: 1235.5
                },
                Command::MarkerSet {
                    kind: MarkerKind::Peak,
                    channel: 1250.0
                },
                Command::FitExecute,
                Command::FitStore,
                Command::SpectrumCalbin { id: 0, binsize: None },
                Command::SpectrumCalbin {
                    id: 0,
                    binsize: Some(2.0)
                },
                Command::FitlistRead {
                    path: PathBuf::from("fits.json"),
                    refit: true
                },
            ]
        );
    }

    #[test]
    fn parses_calibration_coefficients() {
        assert_eq!(
            parse_command("calibration position set 1.5 0.25 1e-6").unwrap(),
            Command::CalibrationSet(vec![1.5, 0.25, 1e-6])
        );
        assert!(parse_command("calibration position set").is_err());
    }

    #[test]
    fn errors_name_the_line() {
        let err = parse_script("fit execute\n\nfit marker peak set abc\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 3"));
        assert!(parse_command("fit marker shoulder set 3").is_err());
        assert!(parse_command("spectrum calbin 0 -b").is_err());
    }
}
