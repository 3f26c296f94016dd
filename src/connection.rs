//! Safe wrapper around libpq for the two connections a streaming session
//! needs: the replication connection (CopyBoth mode) and the side-channel
//! connection used for catalog queries and publication management.

use crate::errors::{StreamerError, StreamerResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::ptr;

pub struct PgConnection {
    conn: *mut PGconn,
}

// libpq's PGconn is only ever touched from the blocking thread that owns
// it (every call site goes through `spawn_blocking`), so it's safe to hand
// across an await point as long as two threads never drive it concurrently.
unsafe impl Send for PgConnection {}

impl PgConnection {
    pub fn connect(conninfo: &str) -> StreamerResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(StreamerError::connect("failed to allocate connection object"));
        }

        if unsafe { PQstatus(conn) } != ConnStatusType::CONNECTION_OK {
            let message = error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(StreamerError::connect(format!("connection failed: {message}")));
        }

        Ok(Self { conn })
    }

    pub fn exec(&self, query: &str) -> StreamerResult<PgResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(StreamerError::protocol(format!("query execution failed: {message}")));
        }

        Ok(PgResult { result })
    }

    /// Blocking read of one COPY row. `-2` from libpq surfaces as an error,
    /// `-1` (COPY done) surfaces as `Ok(None)` after checking the final
    /// command status, `0` cannot happen here since we always read in
    /// blocking mode.
    pub fn get_copy_data(&self) -> StreamerResult<Option<Vec<u8>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match len {
            -2 => {
                let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(StreamerError::protocol(message))
            }
            -1 => {
                let result = PgResult { result: unsafe { PQgetResult(self.conn) } };
                if !result.is_ok() {
                    let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                    return Err(StreamerError::protocol(message));
                }
                Ok(None)
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(StreamerError::protocol("received null COPY buffer"));
                }
                let data = unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    pub fn put_copy_data(&self, data: &[u8]) -> StreamerResult<()> {
        let result = unsafe { PQputCopyData(self.conn, data.as_ptr() as *const std::os::raw::c_char, data.len() as i32) };
        if result != 1 {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(StreamerError::protocol(format!("failed to send COPY data: {message}")));
        }
        Ok(())
    }

    pub fn flush(&self) -> StreamerResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(StreamerError::protocol("failed to flush connection"));
        }
        Ok(())
    }

    /// Sends CopyDone, signaling the end of a COPY BOTH exchange.
    pub fn send_copy_done(&self) -> StreamerResult<()> {
        let result = unsafe { PQputCopyEnd(self.conn, ptr::null()) };
        if result != 1 {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(StreamerError::protocol(format!("failed to send CopyDone: {message}")));
        }
        self.flush()
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let ptr = PQerrorMessage(conn);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}

pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status(), ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK | ExecStatusType::PGRES_COPY_BOTH)
    }

    pub fn is_copy_both(&self) -> bool {
        self.status() == ExecStatusType::PGRES_COPY_BOTH
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        // libpq represents SQL NULL as an empty string from PQgetvalue, not
        // a null pointer; PQgetisnull is the only reliable way to tell it
        // apart from an actual empty-string value.
        if unsafe { PQgetisnull(self.result, row, col) } == 1 {
            return None;
        }
        let ptr = unsafe { PQgetvalue(self.result, row, col) };
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
