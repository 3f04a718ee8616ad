use std::collections::BTreeMap;

/// Strongly typed control identifier.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::ControlId;
///
/// let id = ControlId(42);
/// assert_eq!(id.0, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlId(pub u32);

impl std::fmt::Display for ControlId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Access permissions for a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Behavioural flags a backend attaches to a control.
///
/// `settable_before_streaming` is false for controls the device only honours
/// while frames are flowing; commands touching such a control while the
/// session is idle are ignored rather than executed. `exposure_unit_us` marks
/// the control carrying the exposure time and gives the length of one value
/// step in microseconds; that time bounds the frame poll wait when the device
/// has no frame-rate support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlFlags {
    pub settable_before_streaming: bool,
    pub exposure_unit_us: Option<u32>,
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self {
            settable_before_streaming: true,
            exposure_unit_us: None,
        }
    }
}

/// Simplified control metadata.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{Access, ControlFlags, ControlId, ControlKind, ControlMeta, ControlValue};
///
/// let meta = ControlMeta {
///     id: ControlId(1),
///     name: "gain".into(),
///     kind: ControlKind::Uint,
///     access: Access::ReadWrite,
///     min: ControlValue::Uint(0),
///     max: ControlValue::Uint(255),
///     default: ControlValue::Uint(16),
///     step: Some(ControlValue::Uint(1)),
///     menu: None,
///     flags: ControlFlags::default(),
/// };
/// assert!(meta.validate(&ControlValue::Uint(32)));
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlMeta {
    /// Stable identifier.
    pub id: ControlId,
    /// Human-readable name.
    pub name: String,
    /// Kind of control/value type.
    pub kind: ControlKind,
    /// Access permissions.
    pub access: Access,
    /// Minimum accepted value.
    pub min: ControlValue,
    /// Maximum accepted value.
    pub max: ControlValue,
    /// Default value.
    pub default: ControlValue,
    /// Optional step size for ranged controls.
    #[cfg_attr(feature = "serde", serde(default))]
    pub step: Option<ControlValue>,
    /// Optional enumerated menu entries (for menu controls).
    #[cfg_attr(feature = "serde", serde(default))]
    pub menu: Option<Vec<String>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub flags: ControlFlags,
}

/// Control kind/type metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlKind {
    /// Write-only trigger with no value (V4L2 "button").
    Button,
    Bool,
    Int,
    Int64,
    Uint,
    Float,
    Menu,
    IntMenu,
}

impl ControlKind {
    /// Whether `value` has the variant this kind carries.
    ///
    /// Menus take an index as either `Uint` or non-negative `Int`.
    pub fn accepts(self, value: &ControlValue) -> bool {
        matches!(
            (self, value),
            (ControlKind::Button, ControlValue::None)
                | (ControlKind::Bool, ControlValue::Bool(_))
                | (ControlKind::Int, ControlValue::Int(_))
                | (ControlKind::Int64, ControlValue::Int64(_))
                | (ControlKind::Uint, ControlValue::Uint(_))
                | (ControlKind::Float, ControlValue::Float(_))
                | (
                    ControlKind::Menu | ControlKind::IntMenu,
                    ControlValue::Uint(_) | ControlValue::Int(_)
                )
        )
    }
}

/// Control value variants with minimal footprint.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::ControlValue;
///
/// let v = ControlValue::Bool(true);
/// assert_eq!(v, ControlValue::Bool(true));
/// assert_eq!(ControlValue::Int64(-3).as_i64(), Some(-3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    /// No value.
    None,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i32),
    /// Signed 64-bit integer (absolute exposure, pixel rate).
    Int64(i64),
    /// Unsigned integer.
    Uint(u32),
    /// Floating-point value.
    Float(f32),
}

impl ControlValue {
    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlValue::None => "none",
            ControlValue::Bool(_) => "bool",
            ControlValue::Int(_) => "int",
            ControlValue::Int64(_) => "int64",
            ControlValue::Uint(_) => "uint",
            ControlValue::Float(_) => "float",
        }
    }

    /// Integral view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ControlValue::Bool(v) => Some(*v as i64),
            ControlValue::Int(v) => Some(*v as i64),
            ControlValue::Int64(v) => Some(*v),
            ControlValue::Uint(v) => Some(*v as i64),
            ControlValue::Float(_) | ControlValue::None => None,
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ControlValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(serde::Serialize)]
        #[serde(tag = "kind", content = "value", rename_all = "snake_case")]
        enum Tagged {
            None,
            Bool(bool),
            Int(i32),
            Int64(i64),
            Uint(u32),
            Float(f32),
        }
        let tagged = match self {
            ControlValue::None => Tagged::None,
            ControlValue::Bool(v) => Tagged::Bool(*v),
            ControlValue::Int(v) => Tagged::Int(*v),
            ControlValue::Int64(v) => Tagged::Int64(*v),
            ControlValue::Uint(v) => Tagged::Uint(*v),
            ControlValue::Float(v) => Tagged::Float(*v),
        };
        tagged.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ControlValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(tag = "kind", content = "value", rename_all = "snake_case")]
        enum Tagged {
            None,
            Bool(bool),
            Int(i32),
            Int64(i64),
            Uint(u32),
            Float(f32),
        }
        Ok(match Tagged::deserialize(deserializer)? {
            Tagged::None => ControlValue::None,
            Tagged::Bool(v) => ControlValue::Bool(v),
            Tagged::Int(v) => ControlValue::Int(v),
            Tagged::Int64(v) => ControlValue::Int64(v),
            Tagged::Uint(v) => ControlValue::Uint(v),
            Tagged::Float(v) => ControlValue::Float(v),
        })
    }
}

impl ControlMeta {
    /// Basic range validation respecting the variant.
    ///
    /// # Example
    /// ```rust
    /// use oacam_core::prelude::{Access, ControlFlags, ControlId, ControlKind, ControlMeta, ControlValue};
    ///
    /// let meta = ControlMeta {
    ///     id: ControlId(1),
    ///     name: "brightness".into(),
    ///     kind: ControlKind::Int,
    ///     access: Access::ReadWrite,
    ///     min: ControlValue::Int(-10),
    ///     max: ControlValue::Int(10),
    ///     default: ControlValue::Int(0),
    ///     step: Some(ControlValue::Int(2)),
    ///     menu: None,
    ///     flags: ControlFlags::default(),
    /// };
    /// assert!(meta.validate(&ControlValue::Int(4)));
    /// assert!(!meta.validate(&ControlValue::Int(5)));
    /// ```
    pub fn validate(&self, candidate: &ControlValue) -> bool {
        if let Some(menu) = &self.menu {
            if let ControlValue::Uint(idx) = candidate {
                return (*idx as usize) < menu.len();
            }
            if let ControlValue::Int(idx) = candidate {
                return (*idx >= 0) && ((*idx as usize) < menu.len());
            }
        }

        match (candidate, &self.min, &self.max) {
            (ControlValue::Bool(_), _, _) => true,
            (ControlValue::Int(v), ControlValue::Int(min), ControlValue::Int(max)) => {
                let within = v >= min && v <= max;
                if !within {
                    return false;
                }
                if let Some(ControlValue::Int(step)) = &self.step
                    && *step > 0
                {
                    return ((*v as i64 - *min as i64) % *step as i64) == 0;
                }
                true
            }
            (ControlValue::Int64(v), ControlValue::Int64(min), ControlValue::Int64(max)) => {
                let within = v >= min && v <= max;
                if !within {
                    return false;
                }
                if let Some(ControlValue::Int64(step)) = &self.step
                    && *step > 0
                {
                    return ((*v as i128 - *min as i128) % *step as i128) == 0;
                }
                true
            }
            (ControlValue::Uint(v), ControlValue::Uint(min), ControlValue::Uint(max)) => {
                let within = v >= min && v <= max;
                if !within {
                    return false;
                }
                if let Some(ControlValue::Uint(step)) = &self.step
                    && *step > 0
                {
                    return ((v - min) % step) == 0;
                }
                true
            }
            (ControlValue::Float(v), ControlValue::Float(min), ControlValue::Float(max)) => {
                v >= min && v <= max
            }
            (ControlValue::None, _, _) => self.kind == ControlKind::Button,
            _ => false,
        }
    }

    /// Exposure time encoded by `value`, when this is the exposure control.
    pub fn exposure_duration(&self, value: &ControlValue) -> Option<std::time::Duration> {
        let unit = u64::from(self.flags.exposure_unit_us?);
        let units = u64::try_from(value.as_i64()?).ok()?;
        Some(std::time::Duration::from_micros(units.saturating_mul(unit)))
    }

    /// Label of a menu entry, if this control has one at `index`.
    pub fn menu_label(&self, index: u32) -> Option<&str> {
        self.menu
            .as_ref()
            .and_then(|items| items.get(index as usize))
            .map(String::as_str)
    }
}

/// Reason a control value was refused before reaching the device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlCheckError {
    #[error("control {0} is not supported by this camera")]
    Unknown(ControlId),
    #[error("control {id} expects {expected:?}, got a {found} value")]
    WrongType {
        id: ControlId,
        expected: ControlKind,
        found: &'static str,
    },
    #[error("value for control {0} is outside its range")]
    OutOfRange(ControlId),
}

/// Controls a device supports, keyed by id.
///
/// Built once when a session opens and never mutated afterwards, so it can be
/// shared read-only between the caller threads and the controller.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::*;
///
/// let table = ControlTable::from_iter([ControlMeta {
///     id: ControlId(7),
///     name: "gain".into(),
///     kind: ControlKind::Int,
///     access: Access::ReadWrite,
///     min: ControlValue::Int(0),
///     max: ControlValue::Int(100),
///     default: ControlValue::Int(10),
///     step: Some(ControlValue::Int(1)),
///     menu: None,
///     flags: ControlFlags::default(),
/// }]);
/// assert!(table.check_kind(ControlId(7), &ControlValue::Int(500)).is_ok());
/// assert!(table.check_range(ControlId(7), &ControlValue::Int(500)).is_err());
/// assert!(table.check_kind(ControlId(8), &ControlValue::Int(1)).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ControlTable {
    controls: BTreeMap<ControlId, ControlMeta>,
}

impl FromIterator<ControlMeta> for ControlTable {
    fn from_iter<I: IntoIterator<Item = ControlMeta>>(iter: I) -> Self {
        Self {
            controls: iter.into_iter().map(|meta| (meta.id, meta)).collect(),
        }
    }
}

impl ControlTable {
    pub fn get(&self, id: ControlId) -> Option<&ControlMeta> {
        self.controls.get(&id)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.controls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlMeta> {
        self.controls.values()
    }

    /// The control flagged as carrying the exposure time, if any.
    pub fn exposure_control(&self) -> Option<&ControlMeta> {
        self.controls.values().find(|meta| meta.flags.exposure_unit_us.is_some())
    }

    /// Confirm the control exists and `value` has its type. No range check.
    pub fn check_kind(
        &self,
        id: ControlId,
        value: &ControlValue,
    ) -> Result<&ControlMeta, ControlCheckError> {
        let meta = self.get(id).ok_or(ControlCheckError::Unknown(id))?;
        if !meta.kind.accepts(value) {
            return Err(ControlCheckError::WrongType {
                id,
                expected: meta.kind,
                found: value.type_name(),
            });
        }
        Ok(meta)
    }

    /// [`ControlTable::check_kind`] plus min/max/step validation.
    pub fn check_range(
        &self,
        id: ControlId,
        value: &ControlValue,
    ) -> Result<&ControlMeta, ControlCheckError> {
        let meta = self.check_kind(id, value)?;
        if !meta.validate(value) {
            return Err(ControlCheckError::OutOfRange(id));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn menu_control() -> ControlMeta {
        ControlMeta {
            id: ControlId(3),
            name: "white balance preset".into(),
            kind: ControlKind::Menu,
            access: Access::ReadWrite,
            min: ControlValue::Uint(0),
            max: ControlValue::Uint(2),
            default: ControlValue::Uint(0),
            step: None,
            menu: Some(vec!["auto".into(), "daylight".into(), "tungsten".into()]),
            flags: ControlFlags::default(),
        }
    }

    #[test]
    fn menu_accepts_index_variants() {
        let meta = menu_control();
        assert!(meta.kind.accepts(&ControlValue::Uint(1)));
        assert!(meta.kind.accepts(&ControlValue::Int(1)));
        assert!(!meta.kind.accepts(&ControlValue::Bool(true)));
        assert!(meta.validate(&ControlValue::Uint(2)));
        assert!(!meta.validate(&ControlValue::Uint(3)));
        assert!(!meta.validate(&ControlValue::Int(-1)));
    }

    #[test]
    fn menu_label_lookup() {
        let meta = menu_control();
        assert_eq!(meta.menu_label(1), Some("daylight"));
        assert_eq!(meta.menu_label(9), None);
    }

    #[test]
    fn table_reports_wrong_type() {
        let table = ControlTable::from_iter([menu_control()]);
        let err = table
            .check_kind(ControlId(3), &ControlValue::Float(1.0))
            .unwrap_err();
        assert_eq!(
            err,
            ControlCheckError::WrongType {
                id: ControlId(3),
                expected: ControlKind::Menu,
                found: "float",
            }
        );
    }

    #[test]
    fn int64_step_validation() {
        let meta = ControlMeta {
            id: ControlId(9),
            name: "exposure".into(),
            kind: ControlKind::Int64,
            access: Access::ReadWrite,
            min: ControlValue::Int64(10),
            max: ControlValue::Int64(60_000_000),
            default: ControlValue::Int64(1000),
            step: Some(ControlValue::Int64(10)),
            menu: None,
            flags: ControlFlags {
                settable_before_streaming: true,
                exposure_unit_us: Some(1),
            },
        };
        assert!(meta.validate(&ControlValue::Int64(20_000)));
        assert_eq!(
            meta.exposure_duration(&ControlValue::Int64(20_000)),
            Some(std::time::Duration::from_millis(20))
        );
        assert!(!meta.validate(&ControlValue::Int64(20_005)));
        assert!(!meta.validate(&ControlValue::Int64(5)));
        let table = ControlTable::from_iter([meta]);
        assert_eq!(table.exposure_control().map(|m| m.id), Some(ControlId(9)));
    }
}
