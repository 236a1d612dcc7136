use std::sync::Mutex;

/// Interior-mutable slot shared between threads, used by generators that are
/// sampled through `&self`.
#[derive(Debug, Default)]
pub(crate) struct MutexCell<T>(Mutex<T>);

impl<'a, T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn with_inner<F: FnOnce(&mut T) -> O, O>(&'a self, func: F) -> O {
        let mut cell = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        func(&mut *cell)
    }
}

impl<T: Clone> Clone for MutexCell<T> {
    fn clone(&self) -> Self {
        Self::new(self.with_inner(|x| x.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_cell_can_mutate_through_shared_ref() {
        let cell = MutexCell::new(vec![1, 2]);
        cell.with_inner(|x| x.push(3));

        let cloned = cell.clone();
        cell.with_inner(|x| x.clear());

        assert_eq!(0, cell.with_inner(|x| x.len()));
        assert_eq!(vec![1, 2, 3], cloned.with_inner(|x| x.clone()));
    }
}
