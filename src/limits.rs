// Hard limits. Anything beyond these is rejected with `LimitExceeded`.

pub const MAX_VENUES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_GAMES_PER_VENUE: usize = 32;
pub const MAX_GAME_NAME_LEN: usize = 64;
/// Materialised (venue, date) grids per venue.
pub const MAX_OPEN_DAYS_PER_VENUE: usize = 3_660;
pub const MAX_BOOKINGS_PER_CUSTOMER: usize = 10_000;
