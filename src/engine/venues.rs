use std::collections::BTreeSet;

use chrono::NaiveTime;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::{format_time_of_day, tiles_exactly, SLOT_UNIT};
use super::txn::Held;
use super::{Engine, EngineError};

fn normalize_games(games: &BTreeSet<String>) -> Result<BTreeSet<String>, EngineError> {
    let games: BTreeSet<String> = games
        .iter()
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty())
        .collect();
    if games.len() > MAX_GAMES_PER_VENUE {
        return Err(EngineError::LimitExceeded("too many games at venue"));
    }
    if games.iter().any(|g| g.len() > MAX_GAME_NAME_LEN) {
        return Err(EngineError::LimitExceeded("game name too long"));
    }
    Ok(games)
}

fn validate_hours(opening: NaiveTime, closing: NaiveTime) -> Result<(), EngineError> {
    if opening >= closing {
        return Err(EngineError::InvalidTimeRange(format!(
            "opening {} is not before closing {}",
            format_time_of_day(opening),
            format_time_of_day(closing)
        )));
    }
    if !tiles_exactly(&TimeRange::new(opening, closing), SLOT_UNIT) {
        return Err(EngineError::InvalidDuration(format!(
            "opening hours {}-{} are not a whole number of slots",
            format_time_of_day(opening),
            format_time_of_day(closing)
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn register_venue(&self, venue: Venue) -> Result<(), EngineError> {
        validate_hours(venue.opening, venue.closing)?;
        if let Some(ref n) = venue.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("venue name too long"));
        }
        let games = normalize_games(&venue.games)?;

        let admin = self.bounded(self.admin.clone().lock_owned()).await?;
        if self.tables.venues.contains_key(&venue.id) {
            return Err(EngineError::AlreadyExists(venue.id));
        }
        if self.tables.venues.len() >= MAX_VENUES {
            return Err(EngineError::LimitExceeded("too many venues"));
        }

        let id = venue.id;
        let mut txn = self.begin();
        txn.hold(Held::Admin { _guard: admin });
        txn.stage(Event::VenueRegistered {
            venue: Venue { games, ..venue },
        });
        txn.commit().await?;
        tracing::info!("registered venue {id}");
        Ok(())
    }

    /// Remove a venue with every slot and booking it owns.
    pub async fn remove_venue(&self, id: Ulid) -> Result<(), EngineError> {
        let admin = self.bounded(self.admin.clone().lock_owned()).await?;
        let gate = self.gate(&id)?;
        let exclusive = self.bounded(gate.write_owned()).await?;

        let mut txn = self.begin();
        txn.hold(Held::Admin { _guard: admin });
        txn.hold(Held::GateExclusive { _guard: exclusive });
        txn.stage(Event::VenueRemoved { id });
        txn.commit().await?;
        self.notify.remove(&id);
        tracing::info!("removed venue {id}");
        Ok(())
    }

    pub fn get_venue(&self, id: &Ulid) -> Result<Venue, EngineError> {
        self.tables
            .venues
            .get(id)
            .map(|v| v.value().clone())
            .ok_or(EngineError::VenueNotFound(*id))
    }

    /// All venues, ordered by id.
    pub fn list_venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.tables.venues.iter().map(|e| e.value().clone()).collect();
        venues.sort_by_key(|v| v.id);
        venues
    }

    pub fn venue_hours(&self, id: &Ulid) -> Result<(NaiveTime, NaiveTime), EngineError> {
        self.get_venue(id).map(|v| (v.opening, v.closing))
    }

    pub fn venue_rate(&self, id: &Ulid) -> Result<u64, EngineError> {
        self.get_venue(id).map(|v| v.rate_per_hour)
    }

    pub fn venue_offers_game(&self, id: &Ulid, game: &str) -> Result<bool, EngineError> {
        self.get_venue(id).map(|v| v.offers(game))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn hours_must_be_ordered() {
        assert!(matches!(
            validate_hours(t(12, 0), t(9, 0)),
            Err(EngineError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn hours_must_tile_whole_slots() {
        assert!(validate_hours(t(9, 0), t(12, 0)).is_ok());
        assert!(validate_hours(t(9, 30), t(11, 30)).is_ok());
        assert!(matches!(
            validate_hours(t(9, 0), t(11, 30)),
            Err(EngineError::InvalidDuration(_))
        ));
    }

    #[test]
    fn games_are_trimmed_and_lowercased() {
        let input: BTreeSet<String> = [" Football", "CRICKET ", "", "football"]
            .into_iter()
            .map(String::from)
            .collect();
        let games = normalize_games(&input).unwrap();
        assert_eq!(
            games.into_iter().collect::<Vec<_>>(),
            vec!["cricket".to_string(), "football".to_string()]
        );
    }

    #[test]
    fn too_many_games_rejected() {
        let input: BTreeSet<String> = (0..=MAX_GAMES_PER_VENUE).map(|i| format!("g{i}")).collect();
        assert!(matches!(
            normalize_games(&input),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
