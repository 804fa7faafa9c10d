//! Per-pixel ToT to energy calibration.
//!
//! Each pixel carries four coefficients `(a, b, c, t)` of the surrogate
//! function `tot = a·E + b − c / (E − t)`. Inverting it gives a quadratic in
//! `E` whose larger root is the physical energy.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader;
use rayon::prelude::*;

use photonpix_core::hit::{PixelCoord, ShortTimestamp, PIXEL_COUNT};

use crate::error::{Error, Result};

/// Bytes per coefficient blob: one little-endian `f64` per pixel.
pub const COEFFICIENT_BYTES: usize = PIXEL_COUNT * std::mem::size_of::<f64>();

const COEFFICIENT_NAMES: [&str; 4] = ["caliba", "calibb", "calibc", "calibt"];

/// Below this `|a|` the quadratic is treated as degenerate.
const MIN_QUADRATIC_COEFFICIENT: f64 = 1e-12;

/// Energy value together with a degenerate-calibration marker.
///
/// `value` is 0.0 whenever `degenerate` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyEstimate {
    /// Energy in keV.
    pub value: f64,
    /// True if the calibration could not be inverted for this input.
    pub degenerate: bool,
}

impl EnergyEstimate {
    const DEGENERATE: Self = Self {
        value: 0.0,
        degenerate: true,
    };
}

/// Per-pixel calibration coefficients with an optional lookup table.
#[derive(Debug, Clone)]
pub struct CalibrationTable {
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    t: Vec<f64>,
    lut: Vec<f64>,
    lut_degenerate: Vec<bool>,
    lut_size: usize,
}

impl Default for CalibrationTable {
    /// Identity-like calibration with `a = 0.5`, `b = c = t = 0`, so that
    /// `E = 2·tot`.
    fn default() -> Self {
        Self::uniform(0.5, 0.0, 0.0, 0.0)
    }
}

impl CalibrationTable {
    /// Creates a table where every pixel shares the same coefficients.
    #[must_use]
    pub fn uniform(a: f64, b: f64, c: f64, t: f64) -> Self {
        Self {
            a: vec![a; PIXEL_COUNT],
            b: vec![b; PIXEL_COUNT],
            c: vec![c; PIXEL_COUNT],
            t: vec![t; PIXEL_COUNT],
            lut: Vec::new(),
            lut_degenerate: Vec::new(),
            lut_size: 0,
        }
    }

    /// Creates a table from four per-pixel coefficient arrays.
    ///
    /// # Errors
    /// Returns [`Error::SizeMismatch`] unless every array holds exactly
    /// 256x256 values.
    pub fn from_coefficients(a: Vec<f64>, b: Vec<f64>, c: Vec<f64>, t: Vec<f64>) -> Result<Self> {
        for (name, values) in COEFFICIENT_NAMES.into_iter().zip([&a, &b, &c, &t]) {
            if values.len() != PIXEL_COUNT {
                return Err(Error::SizeMismatch {
                    name,
                    expected: PIXEL_COUNT,
                    actual: values.len(),
                });
            }
        }
        Ok(Self {
            a,
            b,
            c,
            t,
            lut: Vec::new(),
            lut_degenerate: Vec::new(),
            lut_size: 0,
        })
    }

    /// Loads a calibration XML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid
    /// calibration document (see [`CalibrationTable::from_xml`]).
    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let table = Self::from_xml(&bytes)?;
        log::info!("Loaded calibration from {}", path.display());
        Ok(table)
    }

    /// Parses a calibration XML document.
    ///
    /// The chipset element is the first child of the document root whose tag
    /// contains `-`. Its `caliba`, `calibb`, `calibc` and `calibt` children
    /// hold base64 encoded arrays of 256x256 little-endian `f64`.
    ///
    /// # Errors
    /// Returns an error for malformed XML or base64, a missing chipset
    /// element, a missing coefficient blob or a blob of the wrong size.
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut found_chipset = false;
        let mut in_chipset = false;
        let mut current: Option<usize> = None;
        let mut blobs: [Option<Vec<u8>>; 4] = Default::default();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(element) => {
                    depth += 1;
                    let name = element.name();
                    if depth == 2 && !found_chipset && name.as_ref().contains(&b'-') {
                        found_chipset = true;
                        in_chipset = true;
                    } else if in_chipset && depth == 3 {
                        current = coefficient_slot(name.as_ref());
                        if let Some(slot) = current {
                            blobs[slot].get_or_insert_with(Vec::new);
                        }
                    }
                }
                Event::Empty(element) => {
                    let name = element.name();
                    if depth == 1 && !found_chipset && name.as_ref().contains(&b'-') {
                        found_chipset = true;
                    } else if in_chipset && depth == 2 {
                        if let Some(slot) = coefficient_slot(name.as_ref()) {
                            blobs[slot].get_or_insert_with(Vec::new);
                        }
                    }
                }
                Event::End(_) => {
                    if in_chipset && depth == 3 {
                        current = None;
                    } else if in_chipset && depth == 2 {
                        in_chipset = false;
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Text(text) => {
                    if let (Some(slot), true) = (current, in_chipset) {
                        if let Some(blob) = blobs[slot].as_mut() {
                            blob.extend_from_slice(&text);
                        }
                    }
                }
                Event::CData(data) => {
                    if let (Some(slot), true) = (current, in_chipset) {
                        if let Some(blob) = blobs[slot].as_mut() {
                            blob.extend_from_slice(&data);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !found_chipset {
            return Err(Error::MissingChipset);
        }

        let [a, b, c, t] = blobs;
        Self::from_coefficients(
            decode_coefficients(COEFFICIENT_NAMES[0], a)?,
            decode_coefficients(COEFFICIENT_NAMES[1], b)?,
            decode_coefficients(COEFFICIENT_NAMES[2], c)?,
            decode_coefficients(COEFFICIENT_NAMES[3], t)?,
        )
    }

    /// Fills the lookup table for every pixel and every `tot < max_tot`.
    ///
    /// Pixels are processed in parallel. Calling this again replaces the
    /// previous table; `max_tot == 0` drops it.
    pub fn precompute_lookup_table(&mut self, max_tot: usize) {
        self.lut_size = max_tot;
        if max_tot == 0 {
            self.lut = Vec::new();
            self.lut_degenerate = Vec::new();
            return;
        }

        let mut lut = vec![0.0; PIXEL_COUNT * max_tot];
        let mut degenerate = vec![false; PIXEL_COUNT * max_tot];

        lut.par_chunks_mut(max_tot)
            .zip(degenerate.par_chunks_mut(max_tot))
            .enumerate()
            .for_each(|(pixel, (values, markers))| {
                let (a, b, c, t) = (self.a[pixel], self.b[pixel], self.c[pixel], self.t[pixel]);
                for (tot, (value, marker)) in values.iter_mut().zip(markers.iter_mut()).enumerate()
                {
                    #[allow(clippy::cast_precision_loss)]
                    let estimate = solve(a, b, c, t, tot as f64);
                    *value = estimate.value;
                    *marker = estimate.degenerate;
                }
            });

        let degenerate_cells = degenerate.iter().filter(|&&d| d).count();
        if degenerate_cells > 0 {
            log::debug!(
                "Calibration LUT has {degenerate_cells} degenerate cells (max_tot={max_tot})"
            );
        }

        self.lut = lut;
        self.lut_degenerate = degenerate;
    }

    /// Number of ToT values covered by the lookup table (0 if none).
    #[inline]
    #[must_use]
    pub fn lut_size(&self) -> usize {
        self.lut_size
    }

    /// Returns the `(a, b, c, t)` coefficients of a pixel.
    ///
    /// # Panics
    /// Panics if `pixel` lies outside the 256x256 matrix.
    #[inline]
    #[must_use]
    pub fn coefficients(&self, pixel: PixelCoord) -> (f64, f64, f64, f64) {
        let i = pixel.index();
        (self.a[i], self.b[i], self.c[i], self.t[i])
    }

    /// Energy for a pixel and ToT, from the lookup table when it covers `tot`.
    ///
    /// # Panics
    /// Panics if `pixel` lies outside the 256x256 matrix.
    #[inline]
    #[must_use]
    pub fn energy(&self, pixel: PixelCoord, tot: ShortTimestamp) -> f64 {
        self.estimate(pixel, tot).value
    }

    /// Like [`CalibrationTable::energy`] but also reports degeneracy.
    ///
    /// # Panics
    /// Panics if `pixel` lies outside the 256x256 matrix.
    #[inline]
    #[must_use]
    pub fn estimate(&self, pixel: PixelCoord, tot: ShortTimestamp) -> EnergyEstimate {
        let tot_index = usize::from(tot);
        if tot_index < self.lut_size {
            let i = pixel.index() * self.lut_size + tot_index;
            EnergyEstimate {
                value: self.lut[i],
                degenerate: self.lut_degenerate[i],
            }
        } else {
            let (a, b, c, t) = self.coefficients(pixel);
            solve(a, b, c, t, f64::from(tot))
        }
    }

    /// Solves the calibration quadratic directly, bypassing the lookup table.
    ///
    /// Returns 0.0 when the discriminant is negative or `|a|` is numerically
    /// zero.
    ///
    /// # Panics
    /// Panics if `pixel` lies outside the 256x256 matrix.
    #[must_use]
    pub fn calculate_energy(&self, pixel: PixelCoord, tot: ShortTimestamp) -> f64 {
        let (a, b, c, t) = self.coefficients(pixel);
        solve(a, b, c, t, f64::from(tot)).value
    }
}

/// Inverts `tot = a·E + b − c/(E − t)` for `E`.
fn solve(a: f64, b: f64, c: f64, t: f64, tot: f64) -> EnergyEstimate {
    let qa = a;
    let qb = b - a * t - tot;
    let qc = t * tot - b * t - c;

    if qa.is_nan() || qa.abs() < MIN_QUADRATIC_COEFFICIENT {
        return EnergyEstimate::DEGENERATE;
    }
    let discriminant = qb * qb - 4.0 * qa * qc;
    if discriminant.is_nan() || discriminant < 0.0 {
        return EnergyEstimate::DEGENERATE;
    }

    let root = discriminant.sqrt();
    let value = if qa > 0.0 {
        (-qb + root) / (2.0 * qa)
    } else {
        (-qb - root) / (2.0 * qa)
    };
    if value.is_finite() {
        EnergyEstimate {
            value,
            degenerate: false,
        }
    } else {
        EnergyEstimate::DEGENERATE
    }
}

fn coefficient_slot(name: &[u8]) -> Option<usize> {
    COEFFICIENT_NAMES
        .iter()
        .position(|candidate| candidate.as_bytes() == name)
}

fn decode_coefficients(name: &'static str, blob: Option<Vec<u8>>) -> Result<Vec<f64>> {
    let mut blob = blob.ok_or(Error::MissingCoefficients(name))?;
    blob.retain(|byte| !byte.is_ascii_whitespace());
    let bytes = STANDARD.decode(&blob)?;
    if bytes.len() != COEFFICIENT_BYTES {
        return Err(Error::SizeMismatch {
            name,
            expected: COEFFICIENT_BYTES,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}
