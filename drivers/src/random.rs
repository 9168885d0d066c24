use coopnet_lib::CycleClock;

const DEFAULT_LFSR_SEED: u64 = 0xACE1u64;

/// xorshift64 generator for sequence numbers, IP ids, ports and
/// transaction ids.  Not cryptographic.
#[derive(Clone, Copy, Debug)]
pub struct Lfsr64 {
    state: u64,
}

impl Lfsr64 {
    pub fn with_seed(seed: u64) -> Self {
        let s = if seed == 0 { DEFAULT_LFSR_SEED } else { seed };
        Self { state: s }
    }

    /// Seed from the cycle counter, like the stack does at start-up.
    pub fn from_clock(clock: &dyn CycleClock) -> Self {
        let seed = clock.cycles() as u64 | 1;
        Self::with_seed(seed)
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = if x == 0 { 0xfeedc0de } else { x };
        self.state
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next() >> 16) as u32
    }

    pub fn next_u16(&mut self) -> u16 {
        (self.next() >> 24) as u16
    }
}

impl Default for Lfsr64 {
    fn default() -> Self {
        Self::with_seed(DEFAULT_LFSR_SEED)
    }
}
