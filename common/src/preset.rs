use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::HvacMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// No preset: the requested target temperature is used as-is.
    None,
    Frost,
    Eco,
    Comfort,
    Boost,
    /// Motion driven: resolves to the motion or no-motion preset temperature.
    Activity,
    Safety,
    Power,
}

impl Preset {
    pub const SELECTABLE: [Preset; 6] = [
        Preset::None,
        Preset::Frost,
        Preset::Eco,
        Preset::Comfort,
        Preset::Boost,
        Preset::Activity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Frost => "frost",
            Self::Eco => "eco",
            Self::Comfort => "comfort",
            Self::Boost => "boost",
            Self::Activity => "activity",
            Self::Safety => "safety",
            Self::Power => "power",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "frost" => Some(Self::Frost),
            "eco" => Some(Self::Eco),
            "comfort" => Some(Self::Comfort),
            "boost" => Some(Self::Boost),
            "activity" => Some(Self::Activity),
            "safety" => Some(Self::Safety),
            "power" => Some(Self::Power),
            _ => None,
        }
    }

    /// Internal states that are never offered to the user.
    pub fn is_hidden(self) -> bool {
        matches!(self, Self::Safety | Self::Power)
    }

    /// Presets whose temperature lives in the catalog.
    pub fn has_catalog_temperature(self) -> bool {
        matches!(self, Self::Frost | Self::Eco | Self::Comfort | Self::Boost)
    }
}

/// Temperature table for one thermostat: heating, AC and away variants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetCatalog {
    #[serde(default)]
    pub heat: BTreeMap<Preset, f64>,
    #[serde(default)]
    pub ac: BTreeMap<Preset, f64>,
    #[serde(default)]
    pub heat_away: BTreeMap<Preset, f64>,
    #[serde(default)]
    pub ac_away: BTreeMap<Preset, f64>,
}

impl PresetCatalog {
    pub fn with_heat(entries: &[(Preset, f64)]) -> Self {
        Self {
            heat: entries.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn is_configured(&self, preset: Preset, ac_mode: bool) -> bool {
        if ac_mode {
            self.ac.contains_key(&preset) || self.heat.contains_key(&preset)
        } else {
            self.heat.contains_key(&preset)
        }
    }

    pub fn has_away(&self) -> bool {
        !self.heat_away.is_empty() || !self.ac_away.is_empty()
    }

    pub fn all_temperatures(&self) -> impl Iterator<Item = (Preset, f64)> + '_ {
        self.heat
            .iter()
            .chain(self.ac.iter())
            .chain(self.heat_away.iter())
            .chain(self.ac_away.iter())
            .map(|(preset, temp)| (*preset, *temp))
    }
}

/// Resolves the temperature of a catalog preset.
///
/// `present` is the presence state (`false` selects the away variant when one is
/// configured). AC variants are consulted only when the thermostat supports AC and
/// is cooling; they fall back to the heating table.
pub fn find_preset_temp(
    catalog: &PresetCatalog,
    preset: Preset,
    hvac_mode: HvacMode,
    present: bool,
    ac_mode: bool,
) -> Option<f64> {
    if !preset.has_catalog_temperature() {
        return None;
    }

    let cooling = ac_mode && hvac_mode.is_ac();
    if !present {
        let away = if cooling {
            catalog.ac_away.get(&preset).or_else(|| catalog.heat_away.get(&preset))
        } else {
            catalog.heat_away.get(&preset)
        };
        if let Some(temp) = away {
            return Some(*temp);
        }
    }

    if cooling {
        if let Some(temp) = catalog.ac.get(&preset) {
            return Some(*temp);
        }
    }
    catalog.heat.get(&preset).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PresetCatalog {
        PresetCatalog {
            heat: [(Preset::Frost, 7.0), (Preset::Eco, 17.0), (Preset::Comfort, 19.0)]
                .into_iter()
                .collect(),
            ac: [(Preset::Eco, 27.0), (Preset::Comfort, 25.0)].into_iter().collect(),
            heat_away: [(Preset::Comfort, 16.0)].into_iter().collect(),
            ac_away: [(Preset::Comfort, 29.0)].into_iter().collect(),
        }
    }

    #[test]
    fn heating_lookup() {
        assert_eq!(
            find_preset_temp(&catalog(), Preset::Eco, HvacMode::Heat, true, true),
            Some(17.0)
        );
    }

    #[test]
    fn ac_lookup_falls_back_to_heat_table() {
        let catalog = catalog();
        assert_eq!(
            find_preset_temp(&catalog, Preset::Comfort, HvacMode::Cool, true, true),
            Some(25.0)
        );
        assert_eq!(
            find_preset_temp(&catalog, Preset::Frost, HvacMode::Cool, true, true),
            Some(7.0)
        );
    }

    #[test]
    fn ac_table_ignored_without_ac_support() {
        assert_eq!(
            find_preset_temp(&catalog(), Preset::Comfort, HvacMode::Cool, true, false),
            Some(19.0)
        );
    }

    #[test]
    fn away_variant_when_absent() {
        let catalog = catalog();
        assert_eq!(
            find_preset_temp(&catalog, Preset::Comfort, HvacMode::Heat, false, false),
            Some(16.0)
        );
        assert_eq!(
            find_preset_temp(&catalog, Preset::Comfort, HvacMode::Cool, false, true),
            Some(29.0)
        );
        // No away variant for eco: fall back to the present value.
        assert_eq!(
            find_preset_temp(&catalog, Preset::Eco, HvacMode::Heat, false, false),
            Some(17.0)
        );
    }

    #[test]
    fn hidden_and_manual_presets_have_no_catalog_value() {
        let catalog = catalog();
        for preset in [Preset::None, Preset::Activity, Preset::Safety, Preset::Power] {
            assert_eq!(
                find_preset_temp(&catalog, preset, HvacMode::Heat, true, false),
                None
            );
        }
    }
}
