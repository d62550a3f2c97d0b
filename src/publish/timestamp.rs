/// Output timebase of muxed packets (1/90000 s)
pub const OUTPUT_CLOCK_RATE: i64 = 90_000;

/// Rescales encoder timestamps (`1/fps` ticks) to the 90 kHz output clock and keeps DTS strictly
/// increasing.
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    fps: i64,
    last_dts: Option<i64>,
}

impl TimestampNormalizer {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1) as i64,
            last_dts: None,
        }
    }

    fn rescale(&self, ticks: i64) -> i64 {
        (ticks * OUTPUT_CLOCK_RATE + self.fps / 2) / self.fps
    }

    /// Returns the output `(pts, dts)` for a packet stamped `(pts, dts)` in encoder ticks.
    ///
    /// Negative or inverted stamps are reset to zero before rescaling. A DTS that does not advance
    /// past the previous one is moved to `last + 1` and the PTS follows it.
    pub fn normalize(&mut self, pts: i64, dts: i64) -> (i64, i64) {
        let (pts, dts) = if pts < 0 || dts < 0 || dts > pts {
            (0, 0)
        } else {
            (pts, dts)
        };
        let mut pts = self.rescale(pts);
        let mut dts = self.rescale(dts);

        if let Some(last) = self.last_dts {
            if dts < last + 1 {
                dts = last + 1;
                pts = dts;
            }
        }
        self.last_dts = Some(dts);
        (pts, dts)
    }

    pub fn reset(&mut self) {
        self.last_dts = None;
    }
}
