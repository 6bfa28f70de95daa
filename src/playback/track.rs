//! Per-track state machine

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Uninitialized,
    Pause,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    SetFile,
    Play,
    Pause,
    /// Pause and rewind
    Stop,
    Eof,
    /// Demuxer failure; the track pauses itself
    Error,
    Remove,
}

impl TrackStatus {
    /// The state after `event`, or `None` if the event is illegal here
    pub fn next(self, event: TrackEvent) -> Option<TrackStatus> {
        use TrackEvent as E;
        use TrackStatus as S;

        match (self, event) {
            (S::Uninitialized, E::SetFile) => Some(S::Pause),
            (S::Pause | S::Running, E::Play) => Some(S::Running),
            (S::Pause | S::Running, E::Pause | E::Stop) => Some(S::Pause),
            (S::Running, E::Eof | E::Error) => Some(S::Pause),
            (_, E::Remove) => Some(S::Uninitialized),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let s = TrackStatus::Uninitialized;
        assert_eq!(s.next(TrackEvent::Play), None);

        let s = s.next(TrackEvent::SetFile).unwrap();
        assert_eq!(s, TrackStatus::Pause);
        let s = s.next(TrackEvent::Play).unwrap();
        assert_eq!(s, TrackStatus::Running);
        assert_eq!(s.next(TrackEvent::Eof), Some(TrackStatus::Pause));
        assert_eq!(s.next(TrackEvent::Stop), Some(TrackStatus::Pause));
        assert_eq!(s.next(TrackEvent::SetFile), None);
        assert_eq!(
            TrackStatus::Pause.next(TrackEvent::Remove),
            Some(TrackStatus::Uninitialized)
        );
        // Eof only comes from a running track
        assert_eq!(TrackStatus::Pause.next(TrackEvent::Eof), None);
    }
}
