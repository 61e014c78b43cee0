//! Append-only per-field value buffers.

/// A growable, append-only sequence of one scalar header field. The i-th
/// element of every series a flow keeps corresponds to the i-th received
/// packet.
#[derive(Debug, Clone, Default)]
pub struct FieldSeries<T> {
    values: Vec<T>,
}

impl<T: Copy> FieldSeries<T> {
    pub fn new() -> FieldSeries<T> {
        FieldSeries { values: Vec::new() }
    }

    /// Appends one value and charges the marginal backing-storage growth
    /// (which is amortized, so often zero) to `mem_bytes`.
    pub fn append(&mut self, value: T, mem_bytes: &mut usize) {
        let cap_before = self.values.capacity();
        self.values.push(value);
        let grown = self.values.capacity() - cap_before;
        *mem_bytes += grown * std::mem::size_of::<T>();
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.values.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_get() {
        let mut series = FieldSeries::new();
        let mut mem = 0usize;

        for i in 0..100u32 {
            series.append(i, &mut mem);
        }

        assert_eq!(series.len(), 100);
        assert_eq!(series.get(0), Some(0));
        assert_eq!(series.get(99), Some(99));
        assert_eq!(series.get(100), None);
    }

    #[test]
    fn test_memory_accounting_matches_capacity() {
        let mut series = FieldSeries::new();
        let mut mem = 0usize;

        for i in 0..1000u64 {
            series.append(i, &mut mem);
        }

        // The counter tracks actual backing storage, not logical size.
        assert_eq!(mem, series.values.capacity() * std::mem::size_of::<u64>());
        assert!(mem >= 1000 * std::mem::size_of::<u64>());
    }

    #[test]
    fn test_empty_series() {
        let series: FieldSeries<u16> = FieldSeries::new();
        assert!(series.is_empty());
        assert_eq!(series.get(0), None);
    }
}
