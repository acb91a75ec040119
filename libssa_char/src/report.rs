use super::calibration::Stimulus;
use super::critical_current::Pickoff;
use super::record::ChannelRecord;

/// The headline numbers of one tested column
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub column: usize,
    pub chip_id: String,
    pub ic_min_dac: Option<i32>,
    pub ic_max_dac: Option<i32>,
    pub ic_min_ua: Option<f64>,
    pub ic_max_ua: Option<f64>,
    /// Largest modulation depth of the sweep at the SSA output
    pub vmod_max_mv: Option<f64>,
    pub m_fb_ph: Option<f64>,
    pub m_in_ph: Option<f64>,
    pub fault: Option<String>,
}

impl SummaryRow {
    pub fn from_record(record: &ChannelRecord) -> Self {
        let currents = record.critical_currents();
        let found_dac = |pick: Option<Pickoff>| match pick {
            Some(Pickoff::Found { dac, .. }) => Some(dac),
            _ => None,
        };
        let ic_min_dac = found_dac(currents.map(|c| c.ic_min));
        let ic_max_dac = found_dac(currents.map(|c| c.ic_max));
        let to_ua = |dac: i32| {
            record
                .calibration
                .bias_dac_to_microamps(dac, &record.constants)
        };
        let vmod_max_mv = record.sweep.as_ref().and_then(|sweep| {
            sweep
                .vmod_depth
                .iter()
                .take(sweep.completed_points)
                .cloned()
                .reduce(f64::max)
                .map(|depth| record.calibration.adc_to_millivolts(depth))
        });
        Self {
            column: record.channel(),
            chip_id: record.info.chip_id.clone(),
            ic_min_dac,
            ic_max_dac,
            ic_min_ua: ic_min_dac.map(to_ua),
            ic_max_ua: ic_max_dac.map(to_ua),
            vmod_max_mv,
            m_fb_ph: record
                .mutual_inductance(Stimulus::Feedback)
                .map(|m| m.inductance),
            m_in_ph: record.mutual_inductance(Stimulus::Input).map(|m| m.inductance),
            fault: record.fault.as_ref().map(|f| f.error.to_string()),
        }
    }
}

fn cell<T: std::fmt::Display>(value: Option<T>, width: usize, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:>width$.precision$}"),
        None => format!("{:>width$}", "-"),
    }
}

/// Fixed width summary table, one line per record
pub fn render_table(rows: &[SummaryRow]) -> String {
    let mut table = String::from(
        "Column | Chip             | Ic_min DAC | Ic_max DAC | Ic_min uA | Ic_max uA | Vmod mV | M_fb pH | M_in pH | Fault\n",
    );
    for row in rows {
        table.push_str(&format!(
            "{:6} | {:16} | {} | {} | {} | {} | {} | {} | {} | {}\n",
            row.column,
            row.chip_id,
            cell(row.ic_min_dac, 10, 0),
            cell(row.ic_max_dac, 10, 0),
            cell(row.ic_min_ua, 9, 2),
            cell(row.ic_max_ua, 9, 2),
            cell(row.vmod_max_mv, 7, 3),
            cell(row.m_fb_ph, 7, 2),
            cell(row.m_in_ph, 7, 2),
            row.fault.as_deref().unwrap_or("")
        ));
    }
    table
}
