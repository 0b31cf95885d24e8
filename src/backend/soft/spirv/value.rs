// Runtime values of the CPU interpreter
//
// Every scalar is a 32-bit word; floats are carried as their bit pattern and
// reinterpreted by the instruction that consumes them.

use anyhow::{anyhow, bail, Result};

use super::module::Id;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Word(u32),
    Composite(Vec<Value>),
    Pointer(Pointer),
    /// A storage image resource loaded from its variable
    Image { set: u32, binding: u32 },
    Undef,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pointer {
    /// Function, private and input variables owned by one invocation
    Local { slot: usize, path: Vec<u32>, ty: Id },
    /// Workgroup variables shared by the invocations of one workgroup
    Shared { var: Id, path: Vec<u32>, ty: Id },
    /// Byte offset into a bound buffer
    Buffer { set: u32, binding: u32, offset: u32, ty: Id },
    /// Opaque resource variable, such as a storage image
    Resource { set: u32, binding: u32 },
}

impl Pointer {
    pub fn ty(&self) -> Option<Id> {
        match self {
            Pointer::Local { ty, .. } | Pointer::Shared { ty, .. } | Pointer::Buffer { ty, .. } => Some(*ty),
            Pointer::Resource { .. } => None,
        }
    }
}

impl Value {
    pub fn as_word(&self) -> Option<u32> {
        match self {
            Value::Word(w) => Some(*w),
            Value::Bool(b) => Some(*b as u32),
            Value::Undef => Some(0),
            _ => None,
        }
    }

    pub fn word(&self) -> Result<u32> {
        self.as_word().ok_or_else(|| anyhow!("expected a scalar, found {:?}", self))
    }

    pub fn float(&self) -> Result<f32> {
        Ok(f32::from_bits(self.word()?))
    }

    pub fn boolean(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Word(w) => Ok(*w != 0),
            Value::Undef => Ok(false),
            other => bail!("expected a boolean, found {:?}", other),
        }
    }

    pub fn pointer(&self) -> Result<&Pointer> {
        match self {
            Value::Pointer(p) => Ok(p),
            other => bail!("expected a pointer, found {:?}", other),
        }
    }

    pub fn from_f32(value: f32) -> Self {
        Value::Word(value.to_bits())
    }

    pub fn components(&self) -> Result<&[Value]> {
        match self {
            Value::Composite(parts) => Ok(parts),
            other => bail!("expected a composite, found {:?}", other),
        }
    }

    /// Flatten composites into the scalars they contain
    pub fn scalars(&self) -> Vec<Value> {
        match self {
            Value::Composite(parts) => parts.iter().flat_map(Value::scalars).collect(),
            other => vec![other.clone()],
        }
    }

    /// Component-wise unary operation
    pub fn map(&self, f: &impl Fn(&Value) -> Result<Value>) -> Result<Value> {
        match self {
            Value::Composite(parts) => Ok(Value::Composite(
                parts.iter().map(|p| p.map(f)).collect::<Result<_>>()?,
            )),
            scalar => f(scalar),
        }
    }

    /// Component-wise binary operation. A scalar paired with a vector is
    /// broadcast, as `OpVectorTimesScalar` needs.
    pub fn zip(&self, other: &Value, f: &impl Fn(&Value, &Value) -> Result<Value>) -> Result<Value> {
        match (self, other) {
            (Value::Composite(a), Value::Composite(b)) => {
                if a.len() != b.len() {
                    bail!("component count mismatch: {} vs {}", a.len(), b.len());
                }
                Ok(Value::Composite(
                    a.iter().zip(b).map(|(x, y)| x.zip(y, f)).collect::<Result<_>>()?,
                ))
            }
            (Value::Composite(a), scalar) => Ok(Value::Composite(
                a.iter().map(|x| x.zip(scalar, f)).collect::<Result<_>>()?,
            )),
            (scalar, Value::Composite(b)) => Ok(Value::Composite(
                b.iter().map(|y| scalar.zip(y, f)).collect::<Result<_>>()?,
            )),
            (a, b) => f(a, b),
        }
    }

    /// Component-wise ternary operation
    pub fn zip3(
        &self,
        b: &Value,
        c: &Value,
        f: &impl Fn(&Value, &Value, &Value) -> Result<Value>,
    ) -> Result<Value> {
        match (self, b, c) {
            (Value::Composite(xs), Value::Composite(ys), Value::Composite(zs)) => Ok(Value::Composite(
                xs.iter()
                    .zip(ys)
                    .zip(zs)
                    .map(|((x, y), z)| x.zip3(y, z, f))
                    .collect::<Result<_>>()?,
            )),
            (Value::Composite(xs), y, z) => Ok(Value::Composite(
                xs.iter().map(|x| x.zip3(y, z, f)).collect::<Result<_>>()?,
            )),
            (x, Value::Composite(ys), Value::Composite(zs)) => Ok(Value::Composite(
                ys.iter().zip(zs).map(|(y, z)| x.zip3(y, z, f)).collect::<Result<_>>()?,
            )),
            (x, y, z) => f(x, y, z),
        }
    }

    /// Follow an index path into nested composites
    pub fn extract(&self, path: &[u32]) -> Result<&Value> {
        let mut current = self;
        for &index in path {
            current = match current {
                Value::Composite(parts) => parts
                    .get(index as usize)
                    .ok_or_else(|| anyhow!("index {} out of range", index))?,
                other => bail!("cannot index into {:?}", other),
            };
        }
        Ok(current)
    }

    /// Mutable counterpart of `extract`. Out-of-range paths yield None so
    /// stores past the end can be dropped.
    pub fn extract_mut(&mut self, path: &[u32]) -> Option<&mut Value> {
        let mut current = self;
        for &index in path {
            current = match current {
                Value::Composite(parts) => parts.get_mut(index as usize)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Copy with the component at `path` replaced
    pub fn insert(&self, path: &[u32], value: Value) -> Result<Value> {
        let mut out = self.clone();
        let slot = out
            .extract_mut(path)
            .ok_or_else(|| anyhow!("insert path {:?} out of range", path))?;
        *slot = value;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_broadcasts_scalars() {
        let v = Value::Composite(vec![Value::Word(1), Value::Word(2)]);
        let add = |a: &Value, b: &Value| Ok(Value::Word(a.word()? + b.word()?));
        assert_eq!(
            v.zip(&Value::Word(10), &add).unwrap(),
            Value::Composite(vec![Value::Word(11), Value::Word(12)])
        );
        assert!(v.zip(&Value::Composite(vec![Value::Word(1)]), &add).is_err());
    }

    #[test]
    fn insert_and_extract_follow_paths() {
        let v = Value::Composite(vec![
            Value::Word(0),
            Value::Composite(vec![Value::Word(1), Value::Word(2)]),
        ]);
        let w = v.insert(&[1, 0], Value::Word(9)).unwrap();
        assert_eq!(w.extract(&[1, 0]).unwrap(), &Value::Word(9));
        assert_eq!(v.extract(&[1, 0]).unwrap(), &Value::Word(1));
        assert!(w.clone().extract_mut(&[5]).is_none());
    }
}
