// Column wiring resolved once from the system config. General concept:
// column -> (tower card + tower column for SA bias, feedback and input, DAQ card)
// The calibration of every line is copied in at the same time so that the measurement
// code never has to index the raw config again.
use fxhash::FxHashMap;

use super::calibration::ChannelCalibration;
use super::config::{SystemConfig, TowerLine};
use super::error::ConfigError;

/// Widest DAC or ADC a card may declare; full scale values must fit an i32
pub const MAX_CONVERTER_BITS: u32 = 31;

fn check_bits(field: &'static str, card: &str, bits: u32) -> Result<(), ConfigError> {
    if (1..=MAX_CONVERTER_BITS).contains(&bits) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("card {card} declares {bits} bits, expected 1 to {MAX_CONVERTER_BITS}"),
        })
    }
}

/// Where a line lives on the tower
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TowerAddress {
    pub card: String,
    pub address: u8,
    pub tower_column: usize,
}

impl TowerAddress {
    fn resolve(system: &SystemConfig, line: &TowerLine) -> Result<Self, ConfigError> {
        let card = system.tower_card(&line.tower_card)?;
        check_bits("tower.dac_nbits", &line.tower_card, card.dac_nbits)?;
        if line.tower_col_n >= card.bias_r.len() || line.tower_col_n >= card.gain_effective.len()
        {
            return Err(ConfigError::BadTowerColumn {
                card: line.tower_card.clone(),
                column: line.tower_col_n,
            });
        }
        Ok(Self {
            card: line.tower_card.clone(),
            address: card.addr,
            tower_column: line.tower_col_n,
        })
    }
}

/// Full hardware description of one selected column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnHardware {
    pub column: usize,
    pub sa_bias: TowerAddress,
    pub sa_fb: TowerAddress,
    pub sa_input: TowerAddress,
    pub daq_card: String,
    pub calibration: ChannelCalibration,
}

/// ColumnMap contains the hardware of every column selected for a test, keyed by column number
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    map: FxHashMap<usize, ColumnHardware>,
    order: Vec<usize>,
}

impl ColumnMap {
    /// Resolve the selected columns against the system config.
    ///
    /// Fails on the first column that is not wired or references a missing card.
    pub fn new(system: &SystemConfig, columns: &[usize]) -> Result<Self, ConfigError> {
        let mut cm = ColumnMap::default();
        for column in columns {
            let entry = system.column(*column)?;
            let sa_bias = TowerAddress::resolve(system, &entry.sa_bias)?;
            let sa_fb = TowerAddress::resolve(system, &entry.sa_fb)?;
            let sa_input = TowerAddress::resolve(system, &entry.sa_input)?;
            let daq = system.crate_card(&entry.daq.card)?;
            check_bits("crate.adc_n_bits", &entry.daq.card, daq.adc_n_bits)?;
            check_bits("crate.dac_n_bits", &entry.daq.card, daq.dac_n_bits)?;
            let calibration = ChannelCalibration::from_cards(
                system.tower_card(&sa_bias.card)?,
                sa_bias.tower_column,
                system.tower_card(&sa_fb.card)?,
                sa_fb.tower_column,
                system.tower_card(&sa_input.card)?,
                sa_input.tower_column,
                daq,
            );
            cm.map.insert(
                *column,
                ColumnHardware {
                    column: *column,
                    sa_bias,
                    sa_fb,
                    sa_input,
                    daq_card: entry.daq.card.clone(),
                    calibration,
                },
            );
            cm.order.push(*column);
        }
        Ok(cm)
    }

    /// Get the hardware of a column. None if the column was not selected
    pub fn get_hardware(&self, column: usize) -> Option<&ColumnHardware> {
        self.map.get(&column)
    }

    /// Selected columns in the order they were given
    pub fn iter(&self) -> impl Iterator<Item = &ColumnHardware> {
        self.order.iter().filter_map(|c| self.map.get(c))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_map() {
        let system = SystemConfig::default();
        let map = ColumnMap::new(&system, &[0]).unwrap();
        let hw = map.get_hardware(0).unwrap();
        let expected = TowerAddress {
            card: String::from("sa_bias"),
            address: 3,
            tower_column: 0,
        };
        assert_eq!(hw.sa_bias, expected);
        assert_eq!(hw.sa_fb.address, 4);
        assert_eq!(hw.daq_card, "daq0");
        assert!(map.get_hardware(1).is_none());
    }

    #[test]
    fn test_bad_tower_column() {
        let mut system = SystemConfig::default();
        if let Some(entry) = system.col_map.get_mut("col0") {
            entry.sa_fb.tower_col_n = 12;
        }
        assert!(matches!(
            ColumnMap::new(&system, &[0]),
            Err(ConfigError::BadTowerColumn { column: 12, .. })
        ));
    }

    #[test]
    fn test_missing_card() {
        let mut system = SystemConfig::default();
        system.crate_cards.clear();
        assert!(matches!(
            ColumnMap::new(&system, &[0]),
            Err(ConfigError::MissingCard(_))
        ));
    }
}
