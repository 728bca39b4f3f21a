/// Window length shared by the brightness and temperature filters.
pub const KERNEL_LENGTH: usize = 10;

/// Sample types the moving average can hold.
///
/// `div_len` divides a single slot by the window length. Integer samples truncate
/// toward zero per slot, so an integer mean can sit up to `N - 1` below the exact one.
pub trait Sample: Copy + Default {
    fn div_len(self, len: usize) -> Self;
    fn accumulate(self, other: Self) -> Self;
}

impl Sample for i32 {
    fn div_len(self, len: usize) -> Self {
        self / len as i32
    }

    fn accumulate(self, other: Self) -> Self {
        self.saturating_add(other)
    }
}

impl Sample for f32 {
    fn div_len(self, len: usize) -> Self {
        self / len as f32
    }

    fn accumulate(self, other: Self) -> Self {
        self + other
    }
}

/// Fixed-window moving average over a circular buffer.
///
/// The mean always covers all `N` slots; slots that have not been written yet
/// count as zero, so early readings ramp up from zero during warm-up.
#[derive(Debug, Clone)]
pub struct MovingAverage<T, const N: usize = KERNEL_LENGTH> {
    buffer: [T; N],
    next: usize,
}

impl<T: Sample, const N: usize> MovingAverage<T, N> {
    pub fn new() -> Self {
        Self {
            buffer: [T::default(); N],
            next: 0,
        }
    }

    pub fn push(&mut self, sample: T) {
        self.buffer[self.next] = sample;
        self.next = (self.next + 1) % N;
    }

    pub fn mean(&self) -> T {
        self.buffer
            .iter()
            .fold(T::default(), |acc, sample| acc.accumulate(sample.div_len(N)))
    }
}

impl<T: Sample, const N: usize> Default for MovingAverage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
