use super::profile::GeneratorConfig;

/// Marker commands for one fit on step `step` of the artificial spectrum.
pub fn marker_lines(config: &GeneratorConfig, step: usize) -> Vec<String> {
    let mut lines: Vec<String> = config
        .background_markers(step)
        .into_iter()
        .map(|p| format!("fit marker background set {}", p))
        .collect();
    let (low, high) = config.region_markers(step);
    lines.push(format!("fit marker region set {}", low));
    lines.push(format!("fit marker region set {}", high));
    lines.push(format!("fit marker peak set {}", config.peak_channel(step)));
    lines
}

/// Script that fits and stores the peak of `step`.
pub fn initial_fit_script(config: &GeneratorConfig, step: usize) -> String {
    let mut lines = vec![format!("# fit step {} of {}", step, config.name)];
    lines.extend(marker_lines(config, step));
    lines.push("fit execute".into());
    lines.push("fit store".into());
    lines.join("\n")
}

/// Script that rebins spectrum `id` and fits the same peak again. Markers
/// are set before rebinning so they follow the peak into the new channels.
pub fn calbin_script(config: &GeneratorConfig, step: usize, id: usize, binsize: f64) -> String {
    let mut lines = vec![format!("# calbin with binsize {}", binsize)];
    lines.extend(marker_lines(config, step));
    lines.push(format!("spectrum calbin {} -b {}", id, binsize));
    lines.push("fit execute".into());
    lines.push("fit store".into());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::script::{parse_script, Command};

    #[test]
    fn calbin_script_parses() {
        let config = GeneratorConfig::default();
        let commands = parse_script(&calbin_script(&config, 2, 0, 2.0)).unwrap();
        assert_eq!(commands.len(), 10);
        assert_eq!(
            commands[7],
            Command::SpectrumCalbin {
                id: 0,
                binsize: Some(2.0)
            }
        );
        assert_eq!(commands[9], Command::FitStore);
    }

    #[test]
    fn initial_script_sets_every_marker() {
        let config = GeneratorConfig::default();
        let commands = parse_script(&initial_fit_script(&config, 1)).unwrap();
        let markers = commands
            .iter()
            .filter(|c| matches!(c, Command::MarkerSet { .. }))
            .count();
        assert_eq!(markers, 7);
    }
}
