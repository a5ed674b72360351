// One forward pass over the series; every window update is O(1).

pub const GROWTH_LAG: usize = 4;
pub const ACCEL_WINDOW: usize = 2;
pub const Z_WINDOW: usize = 20;
pub const MOMENTUM_WINDOW: usize = 3;
pub const CORR_WINDOW: usize = 4;

/// First index at which every signal is defined and scoring may begin.
pub const WARM_UP: usize = Z_WINDOW;

#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<f64>,
    head: usize,
    len: usize,
    sum: f64,
    sum_sq: f64,
    // Length of the trailing run of identical values.
    run: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            buf: vec![0.0; capacity],
            head: 0,
            len: 0,
            sum: 0.0,
            sum_sq: 0.0,
            run: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.run = match self.last() {
            Some(last) if last == value => self.run + 1,
            _ => 1,
        };
        if self.is_full() {
            let old = self.buf[self.head];
            self.sum -= old;
            self.sum_sq -= old * old;
        } else {
            self.len += 1;
        }
        self.buf[self.head] = value;
        self.sum += value;
        self.sum_sq += value * value;
        self.head = (self.head + 1) % self.buf.len();
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
        self.run = 0;
    }

    fn last(&self) -> Option<f64> {
        let cap = self.buf.len();
        (self.len > 0).then(|| self.buf[(self.head + cap - 1) % cap])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn mean(&self) -> Option<f64> {
        (self.len > 0).then(|| self.sum / self.len as f64)
    }

    /// Sample (n - 1) standard deviation; `None` for a constant window.
    pub fn sample_std(&self) -> Option<f64> {
        if self.len < 2 || self.is_constant() {
            return None;
        }
        let n = self.len as f64;
        let variance = ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0);
        let std = variance.sqrt();
        (std > 0.0).then_some(std)
    }

    pub fn is_constant(&self) -> bool {
        self.run >= self.len
    }
}

#[derive(Debug, Clone)]
struct PairBuffer {
    xs: RingBuffer,
    ys: RingBuffer,
    products: RingBuffer,
}

impl PairBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            xs: RingBuffer::new(capacity),
            ys: RingBuffer::new(capacity),
            products: RingBuffer::new(capacity),
        }
    }

    fn push(&mut self, x: f64, y: f64) {
        self.xs.push(x);
        self.ys.push(y);
        self.products.push(x * y);
    }

    fn pearson(&self) -> Option<f64> {
        if !self.xs.is_full() || self.xs.is_constant() || self.ys.is_constant() {
            return None;
        }
        let n = self.xs.len() as f64;
        let cov = self.products.sum - self.xs.sum * self.ys.sum / n;
        let var_x = self.xs.sum_sq - self.xs.sum * self.xs.sum / n;
        let var_y = self.ys.sum_sq - self.ys.sum * self.ys.sum / n;
        if var_x <= 0.0 || var_y <= 0.0 {
            return None;
        }
        let corr = cov / (var_x * var_y).sqrt();
        Some(corr.clamp(-1.0, 1.0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RollingSignals {
    pub growth: Vec<Option<f64>>,
    pub growth_accel: Vec<Option<f64>>,
    pub z: Vec<Option<f64>>,
    pub momentum: Vec<Option<bool>>,
    pub corr: Vec<Option<f64>>,
}

impl RollingSignals {
    pub fn len(&self) -> usize {
        self.growth.len()
    }

    pub fn at(&self, index: usize) -> SignalSnapshot {
        SignalSnapshot {
            growth: self.growth[index],
            growth_accel: self.growth_accel[index],
            z: self.z[index],
            momentum: self.momentum[index],
            corr: self.corr[index],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalSnapshot {
    pub growth: Option<f64>,
    pub growth_accel: Option<f64>,
    pub z: Option<f64>,
    pub momentum: Option<bool>,
    pub corr: Option<f64>,
}

pub fn compute_signals(prices: &[f64], rates: &[f64]) -> RollingSignals {
    debug_assert_eq!(prices.len(), rates.len());
    let n = prices.len().min(rates.len());
    let mut signals = RollingSignals {
        growth: Vec::with_capacity(n),
        growth_accel: Vec::with_capacity(n),
        z: Vec::with_capacity(n),
        momentum: Vec::with_capacity(n),
        corr: Vec::with_capacity(n),
    };

    let mut level_window = RingBuffer::new(Z_WINDOW);
    let mut growth_diffs = RingBuffer::new(ACCEL_WINDOW);
    let mut returns = RingBuffer::new(MOMENTUM_WINDOW);
    let mut pairs = PairBuffer::new(CORR_WINDOW);

    for i in 0..n {
        let price = prices[i];

        let growth = (i >= GROWTH_LAG).then(|| price / prices[i - GROWTH_LAG] - 1.0);
        let growth = growth.filter(|g| g.is_finite());
        signals.growth.push(growth);

        let prev_growth = i.checked_sub(1).and_then(|j| signals.growth[j]);
        match (growth, prev_growth) {
            (Some(g), Some(prev)) => growth_diffs.push(g - prev),
            _ => growth_diffs.clear(),
        }
        signals
            .growth_accel
            .push(growth_diffs.is_full().then(|| growth_diffs.mean()).flatten());

        level_window.push(price);
        let z = if level_window.is_full() {
            match (level_window.mean(), level_window.sample_std()) {
                (Some(mean), Some(std)) => Some((price - mean) / std),
                _ => None,
            }
        } else {
            None
        };
        signals.z.push(z);

        if i >= 1 {
            let ret = price / prices[i - 1] - 1.0;
            if ret.is_finite() {
                returns.push(ret);
            } else {
                returns.clear();
            }
        }
        signals
            .momentum
            .push(returns.is_full().then(|| returns.mean().map(|m| m > 0.0)).flatten());

        pairs.push(price, rates[i]);
        signals.corr.push(pairs.pearson());
    }

    signals
}
