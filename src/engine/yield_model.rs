//! Fee-adjusted yield arithmetic shared by the acquisition and disposal phases.

/// Exchange fee model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YieldModel {
    pub fee_rate: f64,
}

impl YieldModel {
    pub fn new(fee_rate: f64) -> Self {
        Self { fee_rate }
    }

    /// Units received when spending `funds` at `price`, net of fees
    pub fn expected_size(&self, funds: f64, price: f64) -> f64 {
        (funds / price) * (1.0 - self.fee_rate)
    }

    /// Cash received when selling `size` at `price`, net of fees
    pub fn expected_funds(&self, size: f64, price: f64) -> f64 {
        price * size * (1.0 - self.fee_rate)
    }

    /// Yield of buying back in: units we would get vs units we last sold
    pub fn acquisition_yield(&self, funds: f64, price: f64, previous_size: f64) -> f64 {
        self.expected_size(funds, price) / previous_size
    }

    /// Yield of selling out: cash we would get vs cash we paid
    pub fn disposal_yield(&self, size: f64, price: f64, funds: f64) -> f64 {
        self.expected_funds(size, price) / funds
    }

    /// Highest buy price that still achieves `yield_threshold`
    ///
    /// Diagnostic only; triggers use the trailing mechanism.
    pub fn acquisition_target_price(
        &self,
        funds: f64,
        previous_size: f64,
        yield_threshold: f64,
    ) -> f64 {
        funds * (1.0 - self.fee_rate) / (yield_threshold * previous_size)
    }

    /// Lowest sell price that still achieves `yield_threshold`
    pub fn disposal_target_price(&self, funds: f64, size: f64, yield_threshold: f64) -> f64 {
        (yield_threshold * funds) / (size * (1.0 - self.fee_rate))
    }
}

/// Round to `decimals` places, the granularity the exchange honors
pub fn round_price(price: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (price * factor).round() / factor
}

/// Floor a cash amount to currency precision (never report cash we don't have)
pub fn floor_currency(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // Nudge before flooring so 99.99999999 from float error stays 100.00
    ((value * factor) + 1e-6).floor() / factor
}
