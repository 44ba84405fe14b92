#![forbid(unsafe_code)]

use ahash::RandomState;
use cf_types::{DType, Scalar, TypeError, infer_dtype};
use hashbrown::HashMap;
use thiserror::Error;

/// Fixed-seed hash state for dictionary lookups. Builds are deterministic
/// across runs so dictionaries never depend on process-level randomness.
const DICTIONARY_HASH_STATE: RandomState = RandomState::with_seeds(
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("dictionary cannot hold more than {max} distinct values")]
    DictionaryOverflow { max: usize },
    #[error("dictionary code {code} out of range for dictionary of {len} values")]
    CodeOutOfRange { code: u32, len: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Bidirectional mapping between strings and dense `u32` codes.
///
/// Codes are assigned in first-seen order starting at 0, so a dictionary of
/// `D` values always uses exactly the codes `0..D`.
#[derive(Debug, Clone)]
pub struct Dictionary {
    values: Vec<String>,
    codes: HashMap<String, u32, RandomState>,
}

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            codes: HashMap::with_capacity_and_hasher(capacity, DICTIONARY_HASH_STATE),
        }
    }

    /// Return the code for `value`, assigning the next free code on first sight.
    pub fn intern(&mut self, value: &str) -> Result<u32, ColumnError> {
        if let Some(&code) = self.codes.get(value) {
            return Ok(code);
        }
        let code = u32::try_from(self.values.len()).map_err(|_| ColumnError::DictionaryOverflow {
            max: u32::MAX as usize,
        })?;
        self.codes.insert(value.to_owned(), code);
        self.values.push(value.to_owned());
        Ok(code)
    }

    #[must_use]
    pub fn code(&self, value: &str) -> Option<u32> {
        self.codes.get(value).copied()
    }

    #[must_use]
    pub fn resolve(&self, code: u32) -> Option<&str> {
        self.values.get(code as usize).map(String::as_str)
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

/// Contiguous typed storage for one column.
///
/// Strings are stored as `u32` codes into a dictionary built once when the
/// column is constructed; consumers that only need equality (grouping, joins)
/// never touch the string bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8Dictionary {
        codes: Vec<u32>,
        dictionary: Dictionary,
    },
}

impl ColumnData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8Dictionary { .. } => DType::Utf8Dictionary,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int64(d) => d.len(),
            Self::Float64(d) => d.len(),
            Self::Utf8Dictionary { codes, .. } => codes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable, length-fixed, single-typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    data: ColumnData,
}

impl Column {
    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            data: ColumnData::Int64(values),
        }
    }

    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            data: ColumnData::Float64(values),
        }
    }

    /// Build a dictionary-encoded column in one scan over `values`.
    pub fn from_strings<I, S>(values: I) -> Result<Self, ColumnError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values.into_iter();
        let mut codes = Vec::with_capacity(values.size_hint().0);
        let mut dictionary = Dictionary::new();
        for value in values {
            codes.push(dictionary.intern(value.as_ref())?);
        }
        Ok(Self {
            data: ColumnData::Utf8Dictionary { codes, dictionary },
        })
    }

    /// Assemble a dictionary column from pre-computed codes.
    pub fn from_dictionary(codes: Vec<u32>, dictionary: Dictionary) -> Result<Self, ColumnError> {
        if let Some(&code) = codes.iter().find(|&&code| code as usize >= dictionary.len()) {
            return Err(ColumnError::CodeOutOfRange {
                code,
                len: dictionary.len(),
            });
        }
        Ok(Self {
            data: ColumnData::Utf8Dictionary { codes, dictionary },
        })
    }

    /// Construct a column of `dtype`, rejecting any value of another dtype.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let mismatch = |position: usize, found: &Scalar| {
            ColumnError::Type(TypeError::TypeMismatch {
                expected: dtype,
                found: found.dtype(),
                position,
            })
        };

        match dtype {
            DType::Int64 => {
                let mut out = Vec::with_capacity(values.len());
                for (position, value) in values.iter().enumerate() {
                    match value {
                        Scalar::Int64(v) => out.push(*v),
                        other => return Err(mismatch(position, other)),
                    }
                }
                Ok(Self::from_i64(out))
            }
            DType::Float64 => {
                let mut out = Vec::with_capacity(values.len());
                for (position, value) in values.iter().enumerate() {
                    match value {
                        Scalar::Float64(v) => out.push(*v),
                        other => return Err(mismatch(position, other)),
                    }
                }
                Ok(Self::from_f64(out))
            }
            DType::Utf8Dictionary => {
                let mut codes = Vec::with_capacity(values.len());
                let mut dictionary = Dictionary::new();
                for (position, value) in values.iter().enumerate() {
                    match value {
                        Scalar::Utf8(v) => codes.push(dictionary.intern(v)?),
                        other => return Err(mismatch(position, other)),
                    }
                }
                Ok(Self {
                    data: ColumnData::Utf8Dictionary { codes, dictionary },
                })
            }
        }
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            ColumnData::Int64(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ColumnData::Float64(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn codes(&self) -> Option<&[u32]> {
        match &self.data {
            ColumnData::Utf8Dictionary { codes, .. } => Some(codes),
            _ => None,
        }
    }

    #[must_use]
    pub fn dictionary(&self) -> Option<&Dictionary> {
        match &self.data {
            ColumnData::Utf8Dictionary { dictionary, .. } => Some(dictionary),
            _ => None,
        }
    }

    /// Dictionary code stored at `idx`; `None` for non-dictionary columns.
    #[must_use]
    pub fn code(&self, idx: usize) -> Option<u32> {
        self.codes().and_then(|codes| codes.get(idx).copied())
    }

    #[must_use]
    pub fn resolve(&self, code: u32) -> Option<&str> {
        self.dictionary().and_then(|dictionary| dictionary.resolve(code))
    }

    /// Row value with dictionary codes resolved to their strings.
    #[must_use]
    pub fn value(&self, idx: usize) -> Option<Scalar> {
        match &self.data {
            ColumnData::Int64(values) => values.get(idx).copied().map(Scalar::Int64),
            ColumnData::Float64(values) => values.get(idx).copied().map(Scalar::Float64),
            ColumnData::Utf8Dictionary { codes, dictionary } => codes
                .get(idx)
                .and_then(|&code| dictionary.resolve(code))
                .map(|value| Scalar::Utf8(value.to_owned())),
        }
    }

    #[must_use]
    pub fn to_scalars(&self) -> Vec<Scalar> {
        match &self.data {
            ColumnData::Int64(values) => values.iter().copied().map(Scalar::Int64).collect(),
            ColumnData::Float64(values) => values.iter().copied().map(Scalar::Float64).collect(),
            ColumnData::Utf8Dictionary { codes, dictionary } => codes
                .iter()
                .filter_map(|&code| dictionary.resolve(code))
                .map(|value| Scalar::Utf8(value.to_owned()))
                .collect(),
        }
    }

    /// Value equality that ignores dictionary code assignment and treats NaN
    /// as equal to NaN.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        if self.dtype() != other.dtype() || self.len() != other.len() {
            return false;
        }
        match (&self.data, &other.data) {
            (ColumnData::Float64(left), ColumnData::Float64(right)) => left
                .iter()
                .zip(right)
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b),
            (ColumnData::Int64(left), ColumnData::Int64(right)) => left == right,
            _ => self.to_scalars() == other.to_scalars(),
        }
    }
}

#[cfg(test)]
mod tests {
    use cf_types::{DType, Scalar, TypeError};

    use super::{Column, ColumnData, ColumnError, Dictionary};

    #[test]
    fn dictionary_assigns_codes_in_first_seen_order() {
        let mut dictionary = Dictionary::new();
        assert_eq!(dictionary.intern("b").expect("b"), 0);
        assert_eq!(dictionary.intern("a").expect("a"), 1);
        assert_eq!(dictionary.intern("b").expect("b again"), 0);
        assert_eq!(dictionary.len(), 2);
        assert_eq!(dictionary.code("a"), Some(1));
        assert_eq!(dictionary.code("zzz"), None);
        assert_eq!(dictionary.resolve(0), Some("b"));
        assert_eq!(dictionary.resolve(2), None);
    }

    #[test]
    fn string_column_stores_codes() {
        let column = Column::from_strings(["a", "b", "a", "c", "b", "a"]).expect("strings");
        assert_eq!(column.dtype(), DType::Utf8Dictionary);
        assert_eq!(column.len(), 6);
        assert_eq!(column.codes(), Some(&[0_u32, 1, 0, 2, 1, 0][..]));
        assert_eq!(column.code(3), Some(2));
        assert_eq!(column.resolve(2), Some("c"));
        assert_eq!(column.value(1), Some(Scalar::from("b")));
        assert_eq!(
            column.dictionary().map(Dictionary::values),
            Some(&["a".to_owned(), "b".to_owned(), "c".to_owned()][..])
        );
    }

    #[test]
    fn from_values_infers_dtype() {
        let ints = Column::from_values(vec![Scalar::Int64(1), Scalar::Int64(2)]).expect("ints");
        assert_eq!(ints.as_i64(), Some(&[1_i64, 2][..]));

        let floats = Column::from_values(vec![Scalar::Float64(0.5)]).expect("floats");
        assert_eq!(floats.dtype(), DType::Float64);
        assert_eq!(floats.value(0), Some(Scalar::Float64(0.5)));
        assert_eq!(floats.value(1), None);

        let strings =
            Column::from_values(vec![Scalar::from("x"), Scalar::from("y")]).expect("strings");
        assert_eq!(strings.to_scalars(), vec![Scalar::from("x"), Scalar::from("y")]);
    }

    #[test]
    fn heterogeneous_values_fail_with_type_mismatch() {
        let err = Column::from_values(vec![Scalar::Int64(1), Scalar::from("a")])
            .expect_err("mixed values");
        assert_eq!(
            err,
            ColumnError::Type(TypeError::TypeMismatch {
                expected: DType::Int64,
                found: DType::Utf8Dictionary,
                position: 1,
            })
        );

        let err = Column::new(DType::Float64, vec![Scalar::Float64(1.0), Scalar::Int64(2)])
            .expect_err("int in float column");
        assert!(matches!(
            err,
            ColumnError::Type(TypeError::TypeMismatch { position: 1, .. })
        ));
    }

    #[test]
    fn from_dictionary_validates_codes() {
        let mut dictionary = Dictionary::new();
        dictionary.intern("only").expect("intern");
        let err = Column::from_dictionary(vec![0, 1], dictionary.clone()).expect_err("code 1");
        assert_eq!(err, ColumnError::CodeOutOfRange { code: 1, len: 1 });

        let column = Column::from_dictionary(vec![0, 0], dictionary).expect("valid codes");
        assert!(matches!(column.data(), ColumnData::Utf8Dictionary { .. }));
    }

    #[test]
    fn semantic_eq_ignores_code_assignment() {
        let mut dictionary = Dictionary::new();
        dictionary.intern("y").expect("y");
        dictionary.intern("x").expect("x");
        let reordered = Column::from_dictionary(vec![1, 0], dictionary).expect("codes");
        let natural = Column::from_strings(["x", "y"]).expect("strings");
        assert_ne!(reordered, natural);
        assert!(reordered.semantic_eq(&natural));

        let nan_left = Column::from_f64(vec![f64::NAN, 1.0]);
        let nan_right = Column::from_f64(vec![f64::NAN, 1.0]);
        assert!(nan_left.semantic_eq(&nan_right));
        assert!(!nan_left.semantic_eq(&Column::from_i64(vec![0, 1])));
    }

    #[test]
    fn empty_columns() {
        let column = Column::from_values(Vec::new()).expect("empty");
        assert!(column.is_empty());
        assert_eq!(column.dtype(), DType::Int64);
        assert!(Column::from_strings(Vec::<String>::new()).expect("no strings").is_empty());
    }
}
