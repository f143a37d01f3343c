use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use super::Metric;
use crate::{HuginnError, Result};

/// A labeled metric family: one `M` per distinct label tuple.
///
/// Instances are created lazily by [`for_labels`](Self::for_labels) and live
/// for the lifetime of the family. Creation is a get-or-insert under the
/// write lock, so racing first observations of the same tuple all receive
/// the same instance.
pub struct Family<M> {
    label_names: Vec<&'static str>,
    make: Box<dyn Fn() -> M + Send + Sync>,
    members: RwLock<HashMap<Vec<String>, Arc<M>>>,
}

/// One member of a family snapshot.
#[derive(Debug, Clone)]
pub struct LabeledSnapshot<S> {
    pub labels: Vec<String>,
    pub value: S,
}

impl<M: Default + 'static> Family<M> {
    /// Family whose members start from `M::default()`.
    pub fn new(label_names: &[&'static str]) -> Self {
        Self::with_constructor(label_names, M::default)
    }
}

impl<M> Family<M> {
    /// Family whose members are built by `make` (e.g. histograms sharing
    /// one bucket layout).
    pub fn with_constructor(
        label_names: &[&'static str],
        make: impl Fn() -> M + Send + Sync + 'static,
    ) -> Self {
        Self {
            label_names: label_names.to_vec(),
            make: Box::new(make),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn label_names(&self) -> &[&'static str] {
        &self.label_names
    }

    /// Get, or create on first use, the instance for this exact label tuple.
    ///
    /// Fails with [`HuginnError::InvalidArgument`] when the number of values
    /// does not match the family's label dimensions.
    pub fn for_labels(&self, values: &[&str]) -> Result<Arc<M>> {
        if values.len() != self.label_names.len() {
            return Err(HuginnError::InvalidArgument(format!(
                "expected {} label values ({}), got {}",
                self.label_names.len(),
                self.label_names.join(", "),
                values.len()
            )));
        }
        let key: Vec<String> = values.iter().map(|v| (*v).to_owned()).collect();

        // Fast path: already created
        if let Some(member) = self
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(member));
        }

        let mut members = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let member = members
            .entry(key)
            .or_insert_with(|| Arc::new((self.make)()));
        Ok(Arc::clone(member))
    }

    /// Number of label tuples seen so far.
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Metric> Family<M> {
    /// Copy every member's value, ordered by label tuple.
    ///
    /// The read lock is held only long enough to clone the member handles;
    /// values are read afterwards so writers are never blocked on it.
    pub fn snapshot(&self) -> Vec<LabeledSnapshot<M::Snapshot>> {
        let members: Vec<(Vec<String>, Arc<M>)> = self
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(labels, member)| (labels.clone(), Arc::clone(member)))
            .collect();
        let mut out: Vec<_> = members
            .into_iter()
            .map(|(labels, member)| LabeledSnapshot {
                labels,
                value: member.snapshot(),
            })
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        out
    }
}

impl<M> fmt::Debug for Family<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("label_names", &self.label_names)
            .field("members", &self.len())
            .finish()
    }
}
