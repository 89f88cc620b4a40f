//! Enrollment records, unique per (sequence, contact).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{SequenceError, SequenceResult};
use crate::types::Enrollment;

#[derive(Default)]
pub struct EnrollmentRepo {
    enrollments: DashMap<Uuid, Enrollment>,
    by_pair: DashMap<(Uuid, Uuid), Uuid>,
}

impl EnrollmentRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the enrollment unless the (sequence, contact) pair exists.
    /// The pair entry is held while inserting, so concurrent callers cannot
    /// both succeed.
    pub fn insert_unique(&self, enrollment: Enrollment) -> SequenceResult<Uuid> {
        let key = (enrollment.sequence_id, enrollment.contact_id);
        match self.by_pair.entry(key) {
            Entry::Occupied(_) => Err(SequenceError::AlreadyEnrolled {
                sequence_id: key.0,
                contact_id: key.1,
            }),
            Entry::Vacant(slot) => {
                let id = enrollment.id;
                self.enrollments.insert(id, enrollment);
                slot.insert(id);
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> SequenceResult<Enrollment> {
        self.enrollments
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| SequenceError::not_found("enrollment", *id))
    }

    pub fn find(&self, sequence_id: &Uuid, contact_id: &Uuid) -> Option<Enrollment> {
        let id = self.by_pair.get(&(*sequence_id, *contact_id)).map(|e| *e)?;
        self.enrollments.get(&id).map(|e| e.clone())
    }

    /// Applies `f` under the row's write guard and returns the updated copy.
    /// An error from `f` leaves the row untouched.
    pub fn update<F>(&self, id: &Uuid, f: F) -> SequenceResult<Enrollment>
    where
        F: FnOnce(&mut Enrollment) -> SequenceResult<()>,
    {
        let mut row = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| SequenceError::not_found("enrollment", *id))?;
        let mut draft = row.clone();
        f(&mut draft)?;
        *row = draft;
        Ok(row.clone())
    }

    pub fn for_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.value().sequence_id == *sequence_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}
