/// Queuing strategy: the pure function pair both stream kinds use to compute
/// backpressure. `size` is evaluated exactly once per chunk, at enqueue time.
pub trait QueuingStrategy<T>: Send + Sync {
    fn high_water_mark(&self) -> f64;
    fn size(&self, chunk: &T) -> f64;
}

/// Counts every chunk as size 1, like the WHATWG `CountQueuingStrategy`.
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    fn size(&self, _chunk: &T) -> f64 {
        1.0
    }
}

/// Measures chunks by byte length. Usable with any chunk type that exposes
/// its length via `AsRef<[u8]>` (`Bytes`, `Vec<u8>`, `&[u8]`, ...).
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T: AsRef<[u8]>> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    fn size(&self, chunk: &T) -> f64 {
        chunk.as_ref().len() as f64
    }
}
