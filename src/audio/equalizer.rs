use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Number of bands the node's equalizer exposes (25 Hz .. 16 kHz).
pub const BAND_COUNT: usize = 15;

/// One band of the equalizer. `band` is 0-based, `gain` is a multiplier offset
/// (0.0 leaves the band untouched).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

impl EqualizerBand {
    pub fn new(band: u8, gain: f32) -> Self {
        Self { band, gain }
    }

    /// Parsea una banda desde JSON: debe tener exactamente `band` y `gain`
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Validation(format!("Equalizer band must be an object, got {}", value)))?;

        if object.len() != 2 || !object.contains_key("band") || !object.contains_key("gain") {
            return Err(Error::Validation(format!(
                "Equalizer band must have exactly the fields 'band' and 'gain', got {}",
                value
            )));
        }

        let band = object["band"]
            .as_u64()
            .and_then(|b| u8::try_from(b).ok())
            .ok_or_else(|| Error::Validation(format!("Invalid band index: {}", object["band"])))?;

        let gain = object["gain"]
            .as_f64()
            .ok_or_else(|| Error::Validation(format!("Invalid band gain: {}", object["gain"])))?;

        Ok(Self { band, gain: gain as f32 })
    }
}

/// Ganancias actuales de las 15 bandas
#[derive(Debug, Clone, PartialEq)]
pub struct Equalizer {
    gains: [f32; BAND_COUNT],
}

impl Equalizer {
    pub fn new() -> Self {
        Self {
            gains: [0.0; BAND_COUNT],
        }
    }

    pub fn gains(&self) -> [f32; BAND_COUNT] {
        self.gains
    }

    /// Checks band indices and gains without touching the current state.
    pub fn validate(bands: &[EqualizerBand]) -> Result<()> {
        for band in bands {
            if usize::from(band.band) >= BAND_COUNT {
                return Err(Error::Validation(format!(
                    "Band index {} is out of range (0..{})",
                    band.band, BAND_COUNT
                )));
            }

            if !band.gain.is_finite() {
                return Err(Error::Validation(format!(
                    "Gain for band {} must be a finite number",
                    band.band
                )));
            }
        }

        Ok(())
    }

    /// Overwrites the given bands. Either every band is applied or none is.
    pub fn apply(&mut self, bands: &[EqualizerBand]) -> Result<()> {
        Self::validate(bands)?;

        for band in bands {
            self.gains[usize::from(band.band)] = band.gain;
        }

        Ok(())
    }

    /// Resetea a valores por defecto
    pub fn reset(&mut self) {
        self.gains = [0.0; BAND_COUNT];
    }

    /// The full 15-band payload sent to the node.
    pub fn bands(&self) -> Vec<EqualizerBand> {
        self.gains
            .iter()
            .enumerate()
            .map(|(i, &gain)| EqualizerBand { band: i as u8, gain })
            .collect()
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_apply_only_overwrites_given_bands() {
        let mut eq = Equalizer::new();
        eq.apply(&[EqualizerBand::new(0, 0.25), EqualizerBand::new(3, -0.1)])
            .unwrap();
        let before = eq.gains();

        eq.apply(&[EqualizerBand::new(14, 0.5)]).unwrap();

        let mut expected = before;
        expected[14] = 0.5;
        assert_eq!(eq.gains(), expected);
    }

    #[test]
    fn test_out_of_range_band_is_rejected_atomically() {
        let mut eq = Equalizer::new();
        let err = eq
            .apply(&[EqualizerBand::new(1, 0.3), EqualizerBand::new(15, 0.3)])
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(eq.gains(), [0.0; BAND_COUNT]);
    }

    #[test]
    fn test_reset_yields_zeros() {
        let mut eq = Equalizer::new();
        eq.apply(&[EqualizerBand::new(7, 1.0)]).unwrap();
        eq.reset();

        assert_eq!(eq.gains(), [0.0; BAND_COUNT]);
        assert_eq!(eq.bands().len(), BAND_COUNT);
    }

    #[test]
    fn test_band_from_value_requires_exact_fields() {
        assert_eq!(
            EqualizerBand::from_value(&json!({ "band": 2, "gain": 0.5 })).unwrap(),
            EqualizerBand::new(2, 0.5)
        );
        assert!(EqualizerBand::from_value(&json!({ "band": 2 })).is_err());
        assert!(EqualizerBand::from_value(&json!({ "band": 2, "gain": 0.5, "extra": 1 })).is_err());
        assert!(EqualizerBand::from_value(&json!({ "band": "2", "gain": 0.5 })).is_err());
        assert!(EqualizerBand::from_value(&json!([2, 0.5])).is_err());
    }

    #[test]
    fn test_band_deserialize_denies_unknown_fields() {
        let parsed: std::result::Result<EqualizerBand, _> =
            serde_json::from_value(json!({ "band": 1, "gain": 0.1, "freq": 60 }));
        assert!(parsed.is_err());
    }
}
