use rand::seq::SliceRandom;
use std::collections::VecDeque;
use tracing::debug;

use super::track::{QueueTrack, Track};
use crate::error::{Error, Result};

/// Pending tracks of a player plus its `current` and `previous` slots.
///
/// `previous` is only written right before `current` is overwritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    items: VecDeque<QueueTrack>,
    current: Option<QueueTrack>,
    previous: Option<QueueTrack>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega un track al final de la cola
    pub fn add(&mut self, track: impl Into<QueueTrack>) {
        let track = track.into();
        debug!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
    }

    /// Inserta un track en la posición `offset`
    pub fn add_at(&mut self, offset: usize, track: impl Into<QueueTrack>) -> Result<()> {
        if offset > self.items.len() {
            return Err(Error::Validation(format!(
                "Offset {} is out of range (queue has {} tracks)",
                offset,
                self.items.len()
            )));
        }

        self.items.insert(offset, track.into());
        Ok(())
    }

    /// Agrega múltiples tracks (playlist)
    pub fn extend<I, T>(&mut self, tracks: I) -> usize
    where
        I: IntoIterator<Item = T>,
        T: Into<QueueTrack>,
    {
        let before = self.items.len();
        self.items.extend(tracks.into_iter().map(Into::into));
        self.items.len() - before
    }

    /// Elimina un track específico
    pub fn remove(&mut self, index: usize) -> Result<QueueTrack> {
        self.items.remove(index).ok_or_else(|| {
            Error::Validation(format!(
                "Index {} is out of range (queue has {} tracks)",
                index,
                self.items.len()
            ))
        })
    }

    /// Elimina los tracks en `start..end`
    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<Vec<QueueTrack>> {
        if start >= end || end > self.items.len() {
            return Err(Error::Validation(format!(
                "Invalid range {}..{} (queue has {} tracks)",
                start,
                end,
                self.items.len()
            )));
        }

        Ok(self.items.drain(start..end).collect())
    }

    /// Limpia la cola (current y previous no se tocan)
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Mezcla la cola
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        debug!("🔀 Cola mezclada");
    }

    pub fn current(&self) -> Option<&QueueTrack> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&QueueTrack> {
        self.previous.as_ref()
    }

    pub fn front(&self) -> Option<&QueueTrack> {
        self.items.front()
    }

    pub fn get(&self, index: usize) -> Option<&QueueTrack> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueTrack> {
        self.items.iter()
    }

    /// Pending tracks, excluding `current`.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending tracks plus one if `current` is set.
    pub fn total_size(&self) -> usize {
        self.items.len() + usize::from(self.current.is_some())
    }

    /// Known duration of `current` plus every pending track, in milliseconds.
    pub fn duration(&self) -> u64 {
        self.current
            .iter()
            .chain(self.items.iter())
            .filter_map(QueueTrack::duration)
            .sum()
    }

    /// Replaces `current`, keeping the old one as `previous`.
    pub fn set_current(&mut self, track: Option<QueueTrack>) {
        if let Some(old) = self.current.take() {
            self.previous = Some(old);
        }
        self.current = track;
    }

    /// Moves the next pending track into `current`. Returns whether there was one.
    pub fn advance(&mut self) -> bool {
        let next = self.items.pop_front();
        let advanced = next.is_some();
        self.set_current(next);
        advanced
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueueTrack> {
        self.items.pop_front()
    }

    /// Drops the next `count` pending tracks.
    pub(crate) fn skip(&mut self, count: usize) {
        let count = count.min(self.items.len());
        self.items.drain(..count);
    }

    /// Swaps the resolved version in for `current` if it is still `expected`.
    pub(crate) fn resolve_current(&mut self, expected: &QueueTrack, resolved: Track) -> bool {
        match &self.current {
            Some(current) if current == expected => {
                self.current = Some(QueueTrack::Resolved(resolved));
                true
            }
            _ => false,
        }
    }
}
