//! Ids for host values referenced from the sandbox.

/// A table of host values addressed by nonzero 32-bit ids.
///
/// Released ids leave holes that later insertions reuse, so ids stay small
/// and the table does not grow while the number of live values is stable.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    holes: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        HandleTable {
            slots: Vec::new(),
            holes: 0,
        }
    }

    /// Stores `value`, returning its id.
    pub fn add(&mut self, value: T) -> u32 {
        if self.holes > 0 {
            if let Some(i) = self.slots.iter().position(Option::is_none) {
                self.holes -= 1;
                self.slots[i] = Some(value);
                return i as u32 + 1;
            }
        }
        self.slots.push(Some(value));
        self.slots.len() as u32
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        let i = (id as usize).checked_sub(1)?;
        self.slots.get(i)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let i = (id as usize).checked_sub(1)?;
        self.slots.get_mut(i)?.as_mut()
    }

    /// Takes the value out, freeing its id.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let i = (id as usize).checked_sub(1)?;
        let value = self.slots.get_mut(i)?.take()?;
        if i + 1 == self.slots.len() {
            self.slots.pop();
            while let Some(None) = self.slots.last() {
                self.slots.pop();
                self.holes -= 1;
            }
        } else {
            self.holes += 1;
        }
        Some(value)
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots.len() - self.holes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every value, most recently added id first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.holes = 0;
        self.slots.drain(..).rev().flatten()
    }
}
