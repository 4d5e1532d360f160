// libs/slot-booking-cell/src/services/redis_store.rs
//
// Redis-backed slot store. Each state-changing operation is a Lua script so
// the server applies the check and every write as one unit.
//
// Layout (all keys carry the deployment prefix):
//   slot:{id}                 hash  doctor_id, start_time, end_time, booked, version
//   doctor_slots:{doctor}     zset  slot ids scored by start (ms)
//   slot_claim:{slot}         str   appointment id holding the slot
//   slot_appointments:{slot}  set   every appointment created for the slot
//   booked_slots              set   slot ids with the booking flag set
//   appointment:{id}          hash  data (json), status, slot_id
//   booking_outbox:pending    zset  record ids scored by recorded_at (ms)
//   booking_outbox:records    hash  record id -> json

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::redis_pool::{get_connection, RedisKeys};
use crate::services::slot_store::SlotStore;
use crate::{
    Appointment, AppointmentStatus, AppointmentUpdate, BookingError, OutboxRecord, ReserveOutcome,
    Slot, SlotClaim, TimeWindow, TransitionOutcome,
};

const IMPORT_SLOT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'doctor_id', ARGV[1], 'start_time', ARGV[2], 'end_time', ARGV[3], 'booked', ARGV[4], 'version', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[6], ARGV[7])
if ARGV[4] == '1' then
    redis.call('SADD', KEYS[3], ARGV[7])
end
return 1
"#;

const REMOVE_SLOT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end
local claim = redis.call('GET', KEYS[4])
if claim then
    local status = redis.call('HGET', ARGV[2] .. claim, 'status')
    if status == 'pending' or status == 'confirmed' then
        return -1
    end
end
redis.call('DEL', KEYS[1], KEYS[4])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
return 1
"#;

// Returns {code, version, booked}: 1 committed, -1 conflict, -2 missing slot.
const RESERVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {-2, 0, 0}
end
local booked = redis.call('HGET', KEYS[1], 'booked')
local version = tonumber(redis.call('HGET', KEYS[1], 'version'))
if booked == '1' then
    return {-1, version, 1}
end
if version ~= tonumber(ARGV[1]) then
    return {-1, version, 0}
end
local new_version = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'booked', '1')
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('SADD', KEYS[4], ARGV[5])
redis.call('HSET', KEYS[5], 'data', ARGV[3], 'status', ARGV[4], 'slot_id', ARGV[5])
redis.call('ZADD', KEYS[6], ARGV[8], ARGV[6])
redis.call('HSET', KEYS[7], ARGV[6], ARGV[7])
return {1, new_version, 1}
"#;

// Returns {code, slot_version}: 1 applied, -1 status changed, -2 missing
// appointment, -3 slot not claimed by this appointment.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    return {-2, -1}
end
if current ~= ARGV[1] then
    return {-1, -1}
end
local slot_version = -1
if ARGV[4] == '1' then
    if redis.call('GET', KEYS[3]) ~= ARGV[5] then
        return {-3, -1}
    end
    slot_version = redis.call('HINCRBY', KEYS[2], 'version', 1)
    redis.call('HSET', KEYS[2], 'booked', '0')
    redis.call('DEL', KEYS[3])
    redis.call('SREM', KEYS[4], ARGV[6])
end
redis.call('HSET', KEYS[1], 'data', ARGV[3], 'status', ARGV[2])
if ARGV[7] ~= '' then
    redis.call('ZADD', KEYS[5], ARGV[9], ARGV[7])
    redis.call('HSET', KEYS[6], ARGV[7], ARGV[8])
end
return {1, slot_version}
"#;

const RELEASE_ORPHAN_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'booked') ~= '1' then
    return -1
end
if tonumber(redis.call('HGET', KEYS[1], 'version')) ~= tonumber(ARGV[1]) then
    return -1
end
local new_version = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'booked', '0')
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[2])
return new_version
"#;

// Returns 1 written, 0 no longer pending, -1 payload changed since it was read.
const RECORD_FAILURE_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return -1
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

const RECORD_FAILURE_ATTEMPTS: usize = 3;

pub struct RedisSlotStore {
    pool: Pool,
    keys: RedisKeys,
    import_script: Script,
    remove_script: Script,
    reserve_script: Script,
    transition_script: Script,
    release_orphan_script: Script,
    record_failure_script: Script,
}

impl RedisSlotStore {
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self {
            pool,
            keys,
            import_script: Script::new(IMPORT_SLOT_SCRIPT),
            remove_script: Script::new(REMOVE_SLOT_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            release_orphan_script: Script::new(RELEASE_ORPHAN_SCRIPT),
            record_failure_script: Script::new(RECORD_FAILURE_SCRIPT),
        }
    }

    async fn load_slot(&self, conn: &mut Connection, slot_id: Uuid) -> Result<Option<Slot>, BookingError> {
        let fields: HashMap<String, String> = conn.hgetall(self.keys.slot(slot_id)).await?;
        slot_from_hash(slot_id, &fields)
    }

    async fn load_appointments(
        &self,
        conn: &mut Connection,
        appointment_ids: &[String],
    ) -> Result<Vec<Appointment>, BookingError> {
        if appointment_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in appointment_ids {
            pipe.hget(self.keys.appointment(id), "data");
        }
        let rows: Vec<Option<String>> = pipe.query_async(conn).await?;

        rows.into_iter()
            .flatten()
            .map(|data| serde_json::from_str(&data).map_err(BookingError::from))
            .collect()
    }
}

#[async_trait]
impl SlotStore for RedisSlotStore {
    async fn import_slot(&self, slot: Slot) -> Result<(), BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let inserted: i64 = self
            .import_script
            .key(self.keys.slot(slot.id))
            .key(self.keys.doctor_slots(slot.doctor_id))
            .key(self.keys.booked_slots())
            .arg(slot.doctor_id.to_string())
            .arg(slot.start_time.to_rfc3339())
            .arg(slot.end_time.to_rfc3339())
            .arg(if slot.is_booked() { "1" } else { "0" })
            .arg(slot.version())
            .arg(slot.start_time.timestamp_millis())
            .arg(slot.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(BookingError::ValidationError(format!("Slot {} already exists", slot.id)));
        }

        debug!("Imported slot {} for doctor {}", slot.id, slot.doctor_id);
        Ok(())
    }

    async fn remove_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let slot = self
            .load_slot(&mut conn, slot_id)
            .await?
            .ok_or(BookingError::SlotNotFound(slot_id))?;

        let code: i64 = self
            .remove_script
            .key(self.keys.slot(slot_id))
            .key(self.keys.doctor_slots(slot.doctor_id))
            .key(self.keys.booked_slots())
            .key(self.keys.slot_claim(slot_id))
            .arg(slot_id.to_string())
            .arg(self.keys.appointment_prefix())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(slot),
            -1 => Err(BookingError::ValidationError(format!(
                "Slot {} is referenced by a live appointment",
                slot_id
            ))),
            _ => Err(BookingError::SlotNotFound(slot_id)),
        }
    }

    async fn get_slot(&self, slot_id: Uuid) -> Result<Option<Slot>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        self.load_slot(&mut conn, slot_id).await
    }

    async fn list_slots(&self, doctor_id: Uuid, window: &TimeWindow) -> Result<Vec<Slot>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let ids: Vec<String> = conn
            .zrangebyscore(
                self.keys.doctor_slots(doctor_id),
                window.from.timestamp_millis(),
                format!("({}", window.to.timestamp_millis()),
            )
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.slot(id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut slots = Vec::with_capacity(ids.len());
        for (id, fields) in ids.iter().zip(rows.iter()) {
            let slot_id = parse_uuid(id)?;
            if let Some(slot) = slot_from_hash(slot_id, fields)? {
                slots.push(slot);
            }
        }
        slots.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

        Ok(slots)
    }

    async fn try_reserve(
        &self,
        slot_id: Uuid,
        expected_version: u64,
        claim: SlotClaim,
    ) -> Result<ReserveOutcome, BookingError> {
        if claim.appointment.slot_id != slot_id {
            return Err(BookingError::ValidationError(format!(
                "Appointment {} does not reference slot {}",
                claim.appointment.id, slot_id
            )));
        }

        let mut conn = get_connection(&self.pool).await?;
        let appointment_json = serde_json::to_string(&claim.appointment)?;
        let outbox_json = serde_json::to_string(&claim.outbox)?;

        let reply: Vec<i64> = self
            .reserve_script
            .key(self.keys.slot(slot_id))
            .key(self.keys.slot_claim(slot_id))
            .key(self.keys.slot_appointments(slot_id))
            .key(self.keys.booked_slots())
            .key(self.keys.appointment(claim.appointment.id))
            .key(self.keys.outbox_pending())
            .key(self.keys.outbox_records())
            .arg(expected_version)
            .arg(claim.appointment.id.to_string())
            .arg(appointment_json)
            .arg(claim.appointment.status.as_str())
            .arg(slot_id.to_string())
            .arg(claim.outbox.id.to_string())
            .arg(outbox_json)
            .arg(claim.outbox.recorded_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [1, new_version, _] => Ok(ReserveOutcome::Committed {
                new_version: *new_version as u64,
                appointment: claim.appointment,
            }),
            [-1, current_version, booked] => Ok(ReserveOutcome::Conflict {
                current_version: *current_version as u64,
                is_booked: *booked == 1,
            }),
            [-2, ..] => Err(BookingError::SlotNotFound(slot_id)),
            other => Err(BookingError::StorageFailure(format!(
                "Unexpected reserve reply for slot {}: {:?}",
                slot_id, other
            ))),
        }
    }

    async fn get_appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let data: Option<String> = conn.hget(self.keys.appointment(appointment_id), "data").await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn appointments_for_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let ids: Vec<String> = conn.smembers(self.keys.slot_appointments(slot_id)).await?;
        let mut appointments = self.load_appointments(&mut conn, &ids).await?;
        appointments.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(appointments)
    }

    async fn apply_transition(&self, update: AppointmentUpdate) -> Result<TransitionOutcome, BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let appointment = &update.appointment;
        let appointment_json = serde_json::to_string(appointment)?;

        let (outbox_id, outbox_json, recorded_ms) = match &update.outbox {
            Some(record) => (
                record.id.to_string(),
                serde_json::to_string(record)?,
                record.recorded_at.timestamp_millis(),
            ),
            None => (String::new(), String::new(), 0),
        };

        let reply: Vec<i64> = self
            .transition_script
            .key(self.keys.appointment(appointment.id))
            .key(self.keys.slot(appointment.slot_id))
            .key(self.keys.slot_claim(appointment.slot_id))
            .key(self.keys.booked_slots())
            .key(self.keys.outbox_pending())
            .key(self.keys.outbox_records())
            .arg(update.expected_status.as_str())
            .arg(appointment.status.as_str())
            .arg(appointment_json)
            .arg(if update.release_slot { "1" } else { "0" })
            .arg(appointment.id.to_string())
            .arg(appointment.slot_id.to_string())
            .arg(outbox_id)
            .arg(outbox_json)
            .arg(recorded_ms)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [1, slot_version] => Ok(TransitionOutcome::Applied {
                appointment: update.appointment,
                slot_version: (*slot_version >= 0).then_some(*slot_version as u64),
            }),
            [-1, _] => Ok(TransitionOutcome::StatusChanged),
            [-2, _] => Err(BookingError::AppointmentNotFound(appointment.id)),
            [-3, _] => Err(BookingError::StorageFailure(format!(
                "Slot {} is not claimed by appointment {}",
                appointment.slot_id, appointment.id
            ))),
            other => Err(BookingError::StorageFailure(format!(
                "Unexpected transition reply for appointment {}: {:?}",
                appointment.id, other
            ))),
        }
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, BookingError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = get_connection(&self.pool).await?;
        let ids: Vec<String> = conn
            .zrange(self.keys.outbox_pending(), 0, limit as isize - 1)
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.outbox_records())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, row) in ids.iter().zip(rows) {
            match row {
                Some(data) => records.push(serde_json::from_str(&data)?),
                None => warn!("Outbox record {} is indexed but has no payload", id),
            }
        }

        Ok(records)
    }

    async fn mark_dispatched(&self, record_ids: &[Uuid]) -> Result<(), BookingError> {
        if record_ids.is_empty() {
            return Ok(());
        }

        let mut conn = get_connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        for id in record_ids {
            pipe.zrem(self.keys.outbox_pending(), id.to_string()).ignore();
            pipe.hdel(self.keys.outbox_records(), id.to_string()).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }

    async fn record_delivery_failure(&self, record_id: Uuid, error: &str) -> Result<(), BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let records_key = self.keys.outbox_records();

        for _ in 0..RECORD_FAILURE_ATTEMPTS {
            let data: Option<String> = conn.hget(&records_key, record_id.to_string()).await?;
            let Some(data) = data else {
                debug!("Outbox record {} was dispatched before failure was recorded", record_id);
                return Ok(());
            };

            let mut record: OutboxRecord = serde_json::from_str(&data)?;
            record.attempts += 1;
            record.last_error = Some(error.to_string());

            let written: i64 = self
                .record_failure_script
                .key(self.keys.outbox_pending())
                .key(&records_key)
                .arg(record_id.to_string())
                .arg(&data)
                .arg(serde_json::to_string(&record)?)
                .invoke_async(&mut conn)
                .await?;

            match written {
                1 => return Ok(()),
                0 => {
                    debug!("Outbox record {} was dispatched before failure was recorded", record_id);
                    return Ok(());
                }
                _ => continue,
            }
        }

        warn!(
            "Outbox record {} kept changing; delivery failure not recorded after {} attempts",
            record_id, RECORD_FAILURE_ATTEMPTS
        );
        Ok(())
    }

    async fn outbox_depth(&self) -> Result<u64, BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let depth: u64 = conn.zcard(self.keys.outbox_pending()).await?;
        Ok(depth)
    }

    async fn find_orphaned_reservations(&self) -> Result<Vec<Slot>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let booked: Vec<String> = conn.smembers(self.keys.booked_slots()).await?;

        let mut orphans = Vec::new();
        for id in booked {
            let slot_id = parse_uuid(&id)?;
            let Some(slot) = self.load_slot(&mut conn, slot_id).await? else {
                continue;
            };

            let claim: Option<String> = conn.get(self.keys.slot_claim(slot_id)).await?;
            let live = match claim {
                Some(appointment_id) => {
                    let status: Option<String> = conn
                        .hget(self.keys.appointment(&appointment_id), "status")
                        .await?;
                    matches!(status, Some(s) if s != AppointmentStatus::Cancelled.as_str())
                }
                None => false,
            };

            if slot.is_booked() && !live {
                orphans.push(slot);
            }
        }

        Ok(orphans)
    }

    async fn release_orphan(&self, slot_id: Uuid, expected_version: u64) -> Result<Option<u64>, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let new_version: i64 = self
            .release_orphan_script
            .key(self.keys.slot(slot_id))
            .key(self.keys.slot_claim(slot_id))
            .key(self.keys.booked_slots())
            .arg(expected_version)
            .arg(slot_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok((new_version >= 0).then_some(new_version as u64))
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, BookingError> {
    Uuid::parse_str(raw).map_err(|e| BookingError::StorageFailure(format!("Corrupt id {}: {}", raw, e)))
}

fn slot_from_hash(slot_id: Uuid, fields: &HashMap<String, String>) -> Result<Option<Slot>, BookingError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            BookingError::StorageFailure(format!("Slot {} is missing field {}", slot_id, name))
        })
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, BookingError> {
        DateTime::parse_from_rfc3339(field(name)?)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| BookingError::StorageFailure(format!("Slot {} has bad {}: {}", slot_id, name, e)))
    };

    let doctor_id = parse_uuid(field("doctor_id")?)?;
    let version: u64 = field("version")?
        .parse()
        .map_err(|e| BookingError::StorageFailure(format!("Slot {} has bad version: {}", slot_id, e)))?;

    Slot::from_parts(
        slot_id,
        doctor_id,
        timestamp("start_time")?,
        timestamp("end_time")?,
        field("booked")? == "1",
        version,
    )
    .map(Some)
}
