use rusqlite::{params, Connection};

use crate::db::sqlite::{timestamp_from_sql, timestamp_to_sql};
use crate::db::DatabaseError;
use crate::models::PatientContext;

/// Insert or replace the single narrative record for a patient.
pub fn upsert_patient_context(conn: &Connection, ctx: &PatientContext) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patient_context (patient_id, allergy_history, discharge_summary, lab_narrative, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(patient_id) DO UPDATE SET
           allergy_history = excluded.allergy_history,
           discharge_summary = excluded.discharge_summary,
           lab_narrative = excluded.lab_narrative,
           updated_at = excluded.updated_at",
        params![
            ctx.patient_id,
            ctx.allergy_history,
            ctx.discharge_summary,
            ctx.lab_narrative,
            timestamp_to_sql(&ctx.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_patient_context(
    conn: &Connection,
    patient_id: &str,
) -> Result<Option<PatientContext>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT patient_id, allergy_history, discharge_summary, lab_narrative, updated_at
         FROM patient_context WHERE patient_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![patient_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    match rows.next() {
        Some(row) => {
            let (patient_id, allergy_history, discharge_summary, lab_narrative, updated_at) = row?;
            Ok(Some(PatientContext {
                patient_id,
                allergy_history,
                discharge_summary,
                lab_narrative,
                updated_at: timestamp_from_sql(&updated_at)?,
            }))
        }
        None => Ok(None),
    }
}
