/// Exponentially weighted moving average.
///
/// `update` folds a sample in as `value += alpha * (sample - value)`; the
/// first sample seeds the average unless a starting value was given.
#[derive(Clone, Copy, Debug)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Starts from a known value instead of seeding on the first sample.
    pub fn with_value(alpha: f64, value: f64) -> Self {
        Ewma {
            alpha,
            value,
            initialized: true,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if self.initialized {
            self.value += self.alpha * (sample - self.value);
        } else {
            self.value = sample;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
