/*!
# Aberration presets

Aberration presets are text files with the `abp` extension, one `key = value` pair per line:
```text
Ap = 5.0
Wa = 587.56
Z[2, -2] = 0.3
Z[4, 0] = -0.1
```
`Ap` is the aperture diameter `[mm]`, `Wa` the wavelength `[nm]` of the measurement
and `Z[n, m]` the Zernike coefficient `[μm]` of the radial degree `n` and azimuthal frequency `m`.
Only the non-zero coefficients are written.
*/

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use regex::Regex;

use crate::{
    config::{AberrationParameters, AberrationType},
    zernike::{single2double_noll, ZernikeCoefficients},
};

/// Preset file extension
pub const EXTENSION: &str = "abp";

#[derive(thiserror::Error, Debug)]
pub enum PresetError {
    #[error("aberration preset {0:?} not found")]
    NotFound(PathBuf),
    #[error("failed to read or write the aberration preset")]
    Io(#[from] std::io::Error),
    #[error("invalid preset regex")]
    Regex(#[from] regex::Error),
    #[error("malformed preset line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}
type Result<T> = std::result::Result<T, PresetError>;

/// Path of the preset `name` in the folder `folder`
pub fn preset_path<P: AsRef<Path>>(folder: P, name: &str) -> PathBuf {
    folder.as_ref().join(format!("{name}.{EXTENSION}"))
}

/// Parses the contents of a preset file
pub fn parse(name: &str, contents: &str) -> Result<AberrationParameters> {
    let float = r"([+\-]?[0-9]+\.[0-9]+)";
    let re_coefficient =
        Regex::new(&format!(r"Z\[\s*([0-9]+),\s*(-?)\s*([0-9]+)\]\s*[=:]+\s*{float}"))?;
    let re_aperture = Regex::new(&format!(r"Ap\s*[=:]+\s*{float}"))?;
    let re_lambda = Regex::new(&format!(r"Wa\s*[=:]+\s*{float}"))?;
    let re_name = Regex::new(r"Name\s*[=:]+\s*(.+)")?;

    let mut aberration = AberrationParameters {
        aberration_type: AberrationType::Preset,
        name: name.to_string(),
        ..Default::default()
    };
    let mut coefficients = ZernikeCoefficients::default();
    for (i, line) in contents.lines().enumerate() {
        let malformed = || PresetError::Malformed {
            line: i + 1,
            text: line.to_string(),
        };
        if let Some(capture) = re_coefficient.captures(line) {
            let n: i32 = capture[1].parse().map_err(|_| malformed())?;
            let m: i32 = format!("{}{}", &capture[2], &capture[3])
                .parse()
                .map_err(|_| malformed())?;
            let value: f64 = capture[4].parse().map_err(|_| malformed())?;
            if !coefficients.set_coefficient(n, m, value) {
                return Err(malformed());
            }
        } else if let Some(capture) = re_aperture.captures(line) {
            aberration.aperture_diameter = capture[1].parse().map_err(|_| malformed())?;
        } else if let Some(capture) = re_lambda.captures(line) {
            aberration.lambda = capture[1].parse().map_err(|_| malformed())?;
        } else if let Some(capture) = re_name.captures(line) {
            aberration.name = capture[1].trim().to_string();
        } else if line.trim_start().starts_with("Z[") {
            return Err(malformed());
        } else if !line.trim().is_empty() {
            log::debug!("{name}: ignoring preset line {}: {line:?}", i + 1);
        }
    }
    aberration.coefficients = coefficients;
    Ok(aberration)
}

fn decimal(value: f64) -> String {
    let text = value.to_string();
    if text.contains('.') || !value.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

/// Writes an aberration in the preset format
pub fn format(aberration: &AberrationParameters) -> String {
    let mut contents = format!(
        "Ap = {}\nWa = {}\n",
        decimal(aberration.aperture_diameter),
        decimal(aberration.lambda)
    );
    aberration
        .coefficients
        .indexed()
        .skip(1)
        .filter(|(_, value)| *value != 0.)
        .for_each(|(j, value)| {
            let (n, m) = single2double_noll(j);
            contents.push_str(&format!("Z[{n}, {m}] = {}\n", decimal(value)));
        });
    contents
}

/// Loads the preset `name` from the folder `folder`
pub fn load<P: AsRef<Path>>(folder: P, name: &str) -> Result<AberrationParameters> {
    let path = preset_path(folder, name);
    log::debug!("Loading aberration preset: {path:?}");
    if !path.is_file() {
        log::error!("Unable to load aberration preset: {name}");
        return Err(PresetError::NotFound(path));
    }
    parse(name, &fs::read_to_string(path)?)
}

/// Saves the aberration as the preset `name` into the folder `folder`
pub fn save<P: AsRef<Path>>(folder: P, name: &str, aberration: &AberrationParameters) -> Result<PathBuf> {
    let path = preset_path(folder, name);
    log::debug!("Saving aberration preset: {path:?}");
    fs::write(&path, format(aberration))?;
    Ok(path)
}

/// Loads all the presets of the folder `folder`, indexed by name
///
/// Presets that fail to parse are logged and skipped.
pub fn load_presets<P: AsRef<Path>>(folder: P) -> Result<BTreeMap<String, AberrationParameters>> {
    let mut presets = BTreeMap::new();
    for entry in fs::read_dir(folder.as_ref())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match fs::read_to_string(&path)
            .map_err(PresetError::from)
            .and_then(|contents| parse(name, &contents))
        {
            Ok(aberration) => {
                presets.insert(name.to_string(), aberration);
            }
            Err(e) => log::error!("Skipping aberration preset {path:?}: {e}"),
        }
    }
    Ok(presets)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn folder(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("psf-stack-presets-{name}-{}", std::process::id()));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn round_trip() {
        let mut coefficients = ZernikeCoefficients::default();
        coefficients.set_coefficient(2, -2, 0.3);
        coefficients.set_coefficient(4, 0, -0.1);
        let aberration = AberrationParameters::preset(coefficients.clone())
            .aperture_diameter(5.)
            .lambda(587.56);
        let text = format(&aberration);
        assert_eq!(text, "Ap = 5.0\nWa = 587.56\nZ[2, -2] = 0.3\nZ[4, 0] = -0.1\n");

        let folder = folder("round-trip");
        save(&folder, "astigmatism", &aberration).unwrap();
        let loaded = load(&folder, "astigmatism").unwrap();
        assert_eq!(loaded.name, "astigmatism");
        assert_eq!(loaded.aberration_type, AberrationType::Preset);
        assert_eq!(loaded.aperture_diameter, 5.);
        assert_eq!(loaded.lambda, 587.56);
        assert_eq!(loaded.coefficients, coefficients);
        assert_eq!(
            loaded.coefficients.indexed().filter(|(_, v)| *v != 0.).count(),
            2
        );

        let presets = load_presets(&folder).unwrap();
        assert!(presets.contains_key("astigmatism"));
        fs::remove_dir_all(folder).unwrap();
    }

    #[test]
    fn lenient_parsing() {
        let text = "# measured on 2021-03-02\nAp: 4.5\nName = Keratoconus\n  Z[ 3,-1] := +0.25\nfoo = bar\n";
        let aberration = parse("kc", text).unwrap();
        assert_eq!(aberration.aperture_diameter, 4.5);
        assert_eq!(aberration.name, "Keratoconus");
        assert_eq!(aberration.coefficients.coefficient(3, -1), 0.25);
        assert_eq!(aberration.lambda, AberrationParameters::default().lambda);
    }

    #[test]
    fn errors() {
        assert!(matches!(
            parse("bad", "Ap = 5.0\nZ[2, 1] = 0.1\n"),
            Err(PresetError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            parse("bad", "Z[4, 0] = 1\n"),
            Err(PresetError::Malformed { line: 1, .. })
        ));
        let folder = folder("missing");
        assert!(matches!(load(&folder, "nothing"), Err(PresetError::NotFound(_))));
        fs::remove_dir_all(folder).unwrap();
    }
}
