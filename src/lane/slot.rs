/// Holds one resource of a lane. A slot is filled at most once; after the
/// resource is detached it stays released.
#[derive(Debug, Default)]
pub enum Slot<T> {
    #[default]
    Vacant,
    Occupied(T),
    Released,
}

impl<T> Slot<T> {
    pub fn new(value: Option<T>) -> Self {
        match value {
            Some(value) => Slot::Occupied(value),
            None => Slot::Vacant,
        }
    }
    /// Hands the value back if the slot was ever filled.
    pub fn attach(&mut self, value: T) -> Result<(), T> {
        match self {
            Slot::Vacant => {
                *self = Slot::Occupied(value);
                Ok(())
            }
            _ => Err(value),
        }
    }
    /// Detaching an empty or released slot is a no-op.
    pub fn detach(&mut self) -> Option<T> {
        match std::mem::replace(self, Slot::Released) {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }
    pub fn get(&self) -> Option<&T> {
        match self {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }
    pub fn is_attached(&self) -> bool {
        matches!(self, Slot::Occupied(_))
    }
    pub fn is_released(&self) -> bool {
        matches!(self, Slot::Released)
    }
}
