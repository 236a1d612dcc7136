/// Keeps every `stride`-th pushed value, doubling the stride and thinning the
/// kept values whenever the capacity is exceeded.
#[derive(Debug, Clone)]
pub struct BoundedValueLogger<T> {
    items: Vec<(usize, T)>,
    stride: usize,
    capacity: usize,
    counter: usize,
}

impl<T> BoundedValueLogger<T> {
    const MIN_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> Self {
        Self {
            items: vec![],
            stride: 1,
            capacity: capacity.max(Self::MIN_CAPACITY),
            counter: 0,
        }
    }

    /// Returns whether the value was kept.
    pub fn push(&mut self, item: T) -> bool {
        let idx = self.counter;
        self.counter += 1;

        if idx % self.stride != 0 {
            return false;
        }

        self.items.push((idx, item));
        if self.items.len() > self.capacity {
            self.thin();
        }
        true
    }

    fn thin(&mut self) {
        self.stride *= 2;
        let stride = self.stride;
        self.items.retain(|(idx, _)| idx % stride == 0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items.iter().map(|(idx, item)| (*idx, item))
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn bounded_logger_can_remove_excess_items() {
        let mut instance = BoundedValueLogger::new(4);
        for i in 0..4 {
            assert!(instance.push(i));
        }
        assert_eq!(vec![0, 1, 2, 3], instance.iter().map(|(_, x)| *x).collect_vec());

        assert!(instance.push(4));
        assert_eq!(vec![0, 2, 4], instance.iter().map(|(_, x)| *x).collect_vec());

        assert!(!instance.push(5));
        assert!(instance.push(6));
        assert_eq!(vec![0, 2, 4, 6], instance.iter().map(|(_, x)| *x).collect_vec());

        instance.push(7);
        instance.push(8);
        assert_eq!(vec![0, 4, 8], instance.iter().map(|(_, x)| *x).collect_vec());
        assert!(instance.iter().count() <= 4);
    }

    #[test]
    fn bounded_logger_keeps_original_indices() {
        let mut instance = BoundedValueLogger::new(4);
        for loss in [0.9, 0.8, 0.7, 0.6, 0.5] {
            instance.push(loss);
        }

        let indices = instance.iter().map(|(idx, _)| idx).collect_vec();
        assert_eq!(vec![0, 2, 4], indices);
    }
}
