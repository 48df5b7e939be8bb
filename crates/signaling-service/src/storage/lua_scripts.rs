//! Lua scripts for atomic appointment record updates.
//!
//! Status changes are read-check-write on a hash that other services also
//! touch (scheduling, billing), so they run server-side in one step.

/// Update the status of an appointment's session.
///
/// Arguments:
/// - KEYS[1]: Appointment hash (e.g., `telehealth:session:{room}`)
/// - ARGV[1]: New status (waiting, active, recording, ended)
/// - ARGV[2]: Actual start (RFC 3339) or empty
/// - ARGV[3]: Actual end (RFC 3339) or empty
///
/// `actual_start` is written once and never moved. A session that has
/// ended cannot be reopened.
///
/// Returns:
/// - 1: Updated
/// - 0: Rejected (already ended)
/// - -1: No such appointment
pub const UPDATE_SESSION_STATUS: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end

local current = redis.call('HGET', KEYS[1], 'status')
if current == 'ended' and ARGV[1] ~= 'ended' then
    return 0
end

redis.call('HSET', KEYS[1], 'status', ARGV[1])

if ARGV[2] ~= '' and redis.call('HEXISTS', KEYS[1], 'actual_start') == 0 then
    redis.call('HSET', KEYS[1], 'actual_start', ARGV[2])
end

if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[1], 'actual_end', ARGV[3])
end

return 1
";
