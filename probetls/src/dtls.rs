//! DTLS framing: explicit epoch/sequence records carried in packets,
//! handshake message fragmentation and reassembly, packet packing, and
//! the simulated-timeout machinery driven through the packet adaptor.

use crate::alert::{ALERT_PROTOCOL_VERSION, ALERT_RECORD_OVERFLOW};
use crate::buffer::Block;
use crate::conn::{Conn, HalfIn, HalfOut};
use crate::error::{Error, TlsResult};
use crate::{
    DTLS_RECORD_HEADER_LEN, MAX_CIPHERTEXT, MAX_HANDSHAKE, RECORD_TYPE_CHANGE_CIPHER_SPEC,
    RECORD_TYPE_HANDSHAKE, TYPE_FINISHED, VERSION_TLS13,
};

/// Default handshake fragment size when no limit is configured.
const DEFAULT_FRAGMENT_LEN: usize = 1024;

impl Conn {
    /// Read one DTLS record out of the current packet, fetching a new
    /// packet when the current one is exhausted.
    pub(crate) fn dtls_do_read_record(
        &self,
        inp: &mut HalfIn,
        _want: u8,
    ) -> TlsResult<(u8, Block)> {
        let header_len = DTLS_RECORD_HEADER_LEN;

        let mut b = match inp.raw_input.take() {
            Some(b) => b,
            None => inp.half.pool.new_block(),
        };

        if b.data.is_empty() {
            // Read a whole packet into an absurdly large buffer.
            b.resize(MAX_CIPHERTEXT + header_len);
            let n = inp.reader.read(&mut b.data).map_err(|e| {
                let err = Error::from_io(e);
                inp.half.set_error(err.clone());
                err
            })?;
            if n == 0 {
                return Err(inp.half.set_error(Error::CloseNotify));
            }
            if self.config.bugs.max_packet_length != 0 && n > self.config.bugs.max_packet_length {
                return Err(inp.half.set_error(Error::RecordFraming(
                    "exceeded maximum packet length".to_string(),
                )));
            }
            b.data.truncate(n);
        }

        if b.data.len() < header_len {
            return Err(inp.half.set_error(Error::RecordFraming(
                "failed to read record header".to_string(),
            )));
        }

        let typ = b.data[0];
        let vers = u16::from_be_bytes([b.data[1], b.data[2]]);
        if typ != crate::RECORD_TYPE_ALERT {
            if self.have_vers() {
                if vers != self.wire_vers() {
                    let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                    return Err(inp.half.set_error(Error::RecordFraming(format!(
                        "received record with version {:04x} when expecting version {:04x}",
                        vers,
                        self.wire_vers()
                    ))));
                }
            } else if b.data[1] != 0xfe || (b.data[2] != 0xff && b.data[2] != 0xfd) {
                let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                return Err(inp.half.set_error(Error::RecordFraming(
                    "received record with non-DTLS version".to_string(),
                )));
            }
        }

        // Replay discipline: the epoch must match, and the sequence may
        // only advance within it.
        let epoch = [b.data[3], b.data[4]];
        let seq: [u8; 6] = b.data[5..11].try_into().unwrap();
        if epoch != inp.half.seq[..2] {
            return Err(inp.half.set_error(Error::RecordFraming("bad epoch".to_string())));
        }
        let current: [u8; 6] = inp.half.seq[2..8].try_into().unwrap();
        if seq < current {
            return Err(inp.half.set_error(Error::RecordFraming(
                "bad sequence number".to_string(),
            )));
        }
        inp.half.seq[2..8].copy_from_slice(&seq);

        let n = u16::from_be_bytes([b.data[11], b.data[12]]) as usize;
        if n > MAX_CIPHERTEXT || b.data.len() < header_len + n {
            let _ = self.send_alert(ALERT_RECORD_OVERFLOW);
            return Err(inp.half.set_error(Error::RecordFraming(format!(
                "oversized record received with length {}",
                n
            ))));
        }

        let (mut b, rest) = inp.half.pool.split_block(b, header_len + n);
        // Anything left over is the rest of the packet; DTLS reads
        // continue there before taking a fresh packet.
        inp.raw_input = rest;

        let (off, enc_typ) = match inp.half.decrypt(&mut b) {
            Ok(v) => v,
            Err(alert_value) => {
                let _ = self.send_alert(alert_value);
                return Err(inp.half.set_error(Error::CryptoFailure(alert_value)));
            }
        };
        b.off = off;

        let mut typ = typ;
        if self.vers() >= VERSION_TLS13 && !inp.half.cipher.is_none() {
            typ = enc_typ;
        }
        Ok((typ, b))
    }

    // -----------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------

    /// Append a sealed record for `data` to the pending packet.
    fn dtls_seal_record(&self, out: &mut HalfOut, typ: u8, data: &[u8]) -> TlsResult<()> {
        let header_len = DTLS_RECORD_HEADER_LEN;

        let mut explicit_iv_len = 0;
        let mut explicit_iv_is_seq = false;
        if let crate::cipher::CipherState::Cbc(cbc) = &out.half.cipher {
            explicit_iv_len = cbc.block_size();
        } else if let crate::cipher::CipherState::Aead { explicit_nonce, .. } = &out.half.cipher {
            if *explicit_nonce {
                explicit_iv_len = 8;
                explicit_iv_is_seq = true;
            }
        }

        let mut b = out.half.pool.new_block();
        b.resize(header_len + explicit_iv_len + data.len());
        b.data[0] = typ;
        let mut vers = self.wire_vers();
        if vers == 0 {
            // Pre-negotiation records use DTLS 1.0.
            vers = crate::VERSION_DTLS10;
        }
        if self.config.bugs.send_record_version != 0 {
            vers = self.config.bugs.send_record_version;
        }
        b.data[1] = (vers >> 8) as u8;
        b.data[2] = vers as u8;
        // Epoch and sequence, from the mapped outgoing sequence.
        b.data[3..11].copy_from_slice(&out.half.out_seq);
        let m = explicit_iv_len + data.len();
        b.data[11] = (m >> 8) as u8;
        b.data[12] = m as u8;

        if explicit_iv_len > 0 {
            if explicit_iv_is_seq {
                let seq = out.half.out_seq;
                b.data[header_len..header_len + explicit_iv_len].copy_from_slice(&seq);
            } else {
                self.fill_random(&mut b.data[header_len..header_len + explicit_iv_len]);
            }
        }
        b.data[header_len + explicit_iv_len..].copy_from_slice(data);
        out.half.encrypt(&mut b, explicit_iv_len, typ)?;

        out.pending_packet.extend_from_slice(&b.data);
        out.half.pool.free_block(b);
        Ok(())
    }

    /// Flush the pending packet to the transport as one datagram.
    pub(crate) fn dtls_flush_packet(&self, out: &mut HalfOut) -> TlsResult<()> {
        if out.pending_packet.is_empty() {
            return Ok(());
        }
        let packet = std::mem::take(&mut out.pending_packet);
        use std::io::Write as _;
        out.writer.write_all(&packet).map_err(|e| {
            let err = Error::from_io(e);
            out.half.set_error(err.clone());
            err
        })?;
        out.writer.flush().map_err(Error::from_io)?;
        Ok(())
    }

    /// DTLS record write: handshake messages become fragments in the
    /// pending-fragment queue; everything else is sealed and flushed
    /// immediately.
    pub(crate) fn dtls_write_record(
        &self,
        out: &mut HalfOut,
        typ: u8,
        data: &[u8],
    ) -> TlsResult<usize> {
        if typ != RECORD_TYPE_HANDSHAKE {
            // Flush any pending handshake messages before the epoch
            // can change under them.
            self.dtls_flush_handshake(out)?;

            self.dtls_seal_record(out, typ, data)?;
            self.dtls_flush_packet(out)?;

            if typ == RECORD_TYPE_CHANGE_CIPHER_SPEC {
                if let Err(alert) = out.half.change_cipher_spec() {
                    self.send_alert_locked(out, crate::ALERT_LEVEL_ERROR, alert)?;
                }
            }
            return Ok(data.len());
        }

        if data.len() < 4 {
            return Err(Error::Handshake("bad handshake message".to_string()));
        }
        let header = &data[..4];
        let body = &data[4..];
        let is_finished = header[0] == TYPE_FINISHED;

        let mut max_len = self.config.bugs.max_handshake_record_length;
        if max_len == 0 {
            max_len = DEFAULT_FRAGMENT_LEN;
        }

        let make_fragment = |seq: u16, frag_offset: usize, chunk: &[u8]| -> Vec<u8> {
            let mut fragment = Vec::with_capacity(12 + chunk.len());
            fragment.extend_from_slice(header);
            fragment.extend_from_slice(&seq.to_be_bytes());
            fragment.extend_from_slice(&[
                (frag_offset >> 16) as u8,
                (frag_offset >> 8) as u8,
                frag_offset as u8,
            ]);
            fragment.extend_from_slice(&[
                (chunk.len() >> 16) as u8,
                (chunk.len() >> 8) as u8,
                chunk.len() as u8,
            ]);
            fragment.extend_from_slice(chunk);
            fragment
        };

        let seq = out.send_handshake_seq;

        if self.config.bugs.send_empty_fragments {
            out.pending_fragments.push(make_fragment(seq, 0, &[]));
        }
        if self.config.bugs.mix_complete_message_with_fragments {
            out.pending_fragments.push(make_fragment(seq, 0, body));
        }

        let mut frag_offset = 0usize;
        let mut first = true;
        while first || frag_offset < body.len() {
            first = false;
            let frag_len = (body.len() - frag_offset).min(max_len);
            let mut fragment = make_fragment(seq, frag_offset, &body[frag_offset..frag_offset + frag_len]);
            frag_offset += frag_len;

            if !is_finished && self.config.bugs.fragment_message_type_mismatch && frag_offset > frag_len
            {
                fragment[0] = fragment[0].wrapping_add(1);
            }
            if self.config.bugs.fragment_message_length_mismatch && frag_offset > frag_len {
                fragment[3] = fragment[3].wrapping_add(1);
            }

            if self.config.bugs.split_fragments > 0 && fragment.len() > 12 + self.config.bugs.split_fragments
            {
                // Split the fragment into two at the configured body
                // offset, re-deriving the inner headers.
                let split = self.config.bugs.split_fragments;
                let chunk = fragment[12..].to_vec();
                let base = frag_offset - frag_len;
                out.pending_fragments
                    .push(make_fragment(seq, base, &chunk[..split]));
                out.pending_fragments
                    .push(make_fragment(seq, base + split, &chunk[split..]));
            } else {
                out.pending_fragments.push(fragment);
            }
        }

        if self.config.bugs.send_empty_fragments {
            out.pending_fragments
                .push(make_fragment(seq, body.len(), &[]));
        }

        out.send_handshake_seq = out.send_handshake_seq.wrapping_add(1);
        Ok(data.len())
    }

    /// Emit the queued fragments as records and packets, honoring the
    /// reorder/reverse/packing knobs.
    pub(crate) fn dtls_flush_handshake(&self, out: &mut HalfOut) -> TlsResult<()> {
        let mut fragments = std::mem::take(&mut out.pending_fragments);
        if fragments.is_empty() {
            return Ok(());
        }

        if self.config.bugs.reorder_handshake_fragments {
            // A deterministic shuffle: rotate by one so every fragment
            // still arrives, out of order.
            fragments.rotate_left(1);
        } else if self.config.bugs.reverse_handshake_fragments {
            fragments.reverse();
        }

        let max_record_len = self.config.bugs.pack_handshake_fragments;
        let mut records: Vec<Vec<u8>> = Vec::new();
        for fragment in fragments {
            match records.last_mut() {
                Some(last)
                    if max_record_len > 0 && last.len() + fragment.len() <= max_record_len =>
                {
                    last.extend_from_slice(&fragment);
                }
                _ => records.push(fragment),
            }
        }

        let max_packet_len = self.config.bugs.pack_handshake_records;
        for record in records {
            self.dtls_seal_record(out, RECORD_TYPE_HANDSHAKE, &record)?;
            if max_packet_len == 0 || out.pending_packet.len() > max_packet_len {
                self.dtls_flush_packet(out)?;
            }
        }
        self.dtls_flush_packet(out)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Handshake reassembly
    // -----------------------------------------------------------------

    /// Reassemble one handshake message from fragments. Fragments are
    /// expected in order.
    pub(crate) fn dtls_do_read_handshake(&self, inp: &mut HalfIn) -> TlsResult<Vec<u8>> {
        while inp.hand_msg.as_ref().map(|m| m.len()).unwrap_or(0) < 4 + inp.hand_msg_len
            || inp.hand_msg.is_none()
        {
            if inp.hand.is_empty() {
                if let Some(err) = &inp.half.err {
                    return Err(err.clone());
                }
                self.read_record(inp, RECORD_TYPE_HANDSHAKE)?;
            }

            if inp.hand.len() < 12 {
                return Err(Error::RecordFraming("bad handshake record".to_string()));
            }
            let header: Vec<u8> = inp.hand.drain(..12).collect();
            let msg_len =
                ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
            let frag_seq = u16::from_be_bytes([header[4], header[5]]);
            let frag_off =
                ((header[6] as usize) << 16) | ((header[7] as usize) << 8) | header[8] as usize;
            let frag_len =
                ((header[9] as usize) << 16) | ((header[10] as usize) << 8) | header[11] as usize;

            if inp.hand.len() < frag_len {
                return Err(Error::RecordFraming("fragment length too long".to_string()));
            }
            let fragment: Vec<u8> = inp.hand.drain(..frag_len).collect();

            match &mut inp.hand_msg {
                None => {
                    if frag_seq != inp.recv_handshake_seq {
                        return Err(Error::RecordFraming(
                            "bad handshake sequence number".to_string(),
                        ));
                    }
                    if msg_len > MAX_HANDSHAKE {
                        return Err(Error::RecordFraming(
                            "handshake message too large".to_string(),
                        ));
                    }
                    inp.hand_msg_len = msg_len;
                    let mut msg = Vec::with_capacity(4 + msg_len);
                    msg.extend_from_slice(&header[..4]);
                    inp.hand_msg = Some(msg);
                }
                Some(msg) => {
                    if header[0] != msg[0] || msg_len != inp.hand_msg_len {
                        return Err(Error::RecordFraming(
                            "fragment header mismatch".to_string(),
                        ));
                    }
                    if frag_seq != inp.recv_handshake_seq {
                        return Err(Error::RecordFraming(
                            "bad handshake sequence number".to_string(),
                        ));
                    }
                }
            }

            let msg = inp.hand_msg.as_mut().unwrap();
            if frag_off != msg.len() - 4 {
                return Err(Error::RecordFraming("bad fragment offset".to_string()));
            }
            if frag_off + frag_len > inp.hand_msg_len {
                return Err(Error::RecordFraming("bad fragment length".to_string()));
            }
            msg.extend_from_slice(&fragment);

            if msg.len() == 4 + inp.hand_msg_len {
                break;
            }
        }

        inp.recv_handshake_seq = inp.recv_handshake_seq.wrapping_add(1);
        inp.hand_msg_len = 0;
        Ok(inp.hand_msg.take().expect("assembled message"))
    }

    // -----------------------------------------------------------------
    // Timeout simulation
    // -----------------------------------------------------------------

    /// Validate a dropped packet's records against the replay window,
    /// advancing sequence expectations without processing contents.
    pub(crate) fn skip_packet(&self, inp: &mut HalfIn, packet: &[u8]) -> TlsResult<()> {
        let mut rest = packet;
        while !rest.is_empty() {
            if rest.len() < 13 {
                return Err(Error::RecordFraming("bad packet".to_string()));
            }
            let epoch = &rest[3..5];
            let seq: [u8; 6] = rest[5..11].try_into().unwrap();
            let length = u16::from_be_bytes([rest[11], rest[12]]) as usize;
            if epoch == &inp.half.seq[..2] {
                let current: [u8; 6] = inp.half.seq[2..8].try_into().unwrap();
                if seq < current {
                    return Err(Error::RecordFraming("sequence mismatch".to_string()));
                }
                inp.half.seq[2..8].copy_from_slice(&seq);
                inp.half.inc_seq();
            } else {
                if seq < inp.half.next_seq {
                    return Err(Error::RecordFraming("sequence mismatch".to_string()));
                }
                inp.half.next_seq.copy_from_slice(&seq);
                inp.half.inc_next_seq();
            }
            if rest.len() < 13 + length {
                return Err(Error::RecordFraming("bad packet".to_string()));
            }
            rest = &rest[13 + length..];
        }
        Ok(())
    }

    /// Walk the configured TimeoutSchedule: emit a `T` opcode per
    /// entry, absorb the packets the peer flushes, and invoke the
    /// caller's retransmit hook.
    pub(crate) fn simulate_packet_loss<F: FnMut(&Conn) -> TlsResult<()>>(
        &self,
        mut resend: Option<F>,
    ) -> TlsResult<()> {
        if self.config.bugs.timeout_schedule.is_empty() {
            return Ok(());
        }
        if !self.is_dtls {
            return Err(Error::Handshake(
                "TimeoutSchedule may only be set in DTLS".to_string(),
            ));
        }
        let Some(adaptor) = &self.config.bugs.packet_adaptor else {
            return Err(Error::Handshake(
                "TimeoutSchedule set without PacketAdaptor".to_string(),
            ));
        };

        for &timeout in &self.config.bugs.timeout_schedule {
            let packets = adaptor
                .send_read_timeout(timeout)
                .map_err(Error::from_io)?;
            {
                let mut inp = self.inp.lock();
                for packet in &packets {
                    self.skip_packet(&mut inp, packet)?;
                }
            }
            if let Some(hook) = resend.as_mut() {
                hook(self)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::halfconn::HalfConn;
    use std::sync::Arc;

    fn half_in() -> HalfIn {
        let config = Arc::new(Config::default());
        HalfIn {
            half: HalfConn::new(true, config),
            reader: Box::new(std::io::empty()),
            raw_input: None,
            input: None,
            hand: Vec::new(),
            skip_early_data: false,
            seen_handshake_pack_end: false,
            seen_one_byte_record: false,
            expect_tls13_ccs: false,
            recv_handshake_seq: 0,
            hand_msg: None,
            hand_msg_len: 0,
        }
    }

    fn conn_for_test() -> Conn {
        Conn::dtls_client(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            Arc::new(Config::default()),
        )
    }

    fn packet_with_record(epoch: u16, seq: u64, body_len: usize) -> Vec<u8> {
        let mut packet = vec![RECORD_TYPE_HANDSHAKE, 0xfe, 0xfd];
        packet.extend_from_slice(&epoch.to_be_bytes());
        packet.extend_from_slice(&seq.to_be_bytes()[2..]);
        packet.extend_from_slice(&(body_len as u16).to_be_bytes());
        packet.extend_from_slice(&vec![0u8; body_len]);
        packet
    }

    #[test]
    fn test_skip_packet_advances_sequence() {
        let conn = conn_for_test();
        let mut inp = half_in();
        conn.skip_packet(&mut inp, &packet_with_record(0, 3, 5)).unwrap();
        // Sequence advanced past 3.
        assert_eq!(inp.half.seq[7], 4);

        // A replay (seq below the window) is rejected.
        let err = conn.skip_packet(&mut inp, &packet_with_record(0, 2, 5));
        assert!(err.is_err());
    }

    #[test]
    fn test_skip_packet_next_epoch_tracked() {
        let conn = conn_for_test();
        let mut inp = half_in();
        conn.skip_packet(&mut inp, &packet_with_record(1, 7, 2)).unwrap();
        assert_eq!(inp.half.next_seq[5], 8);
        // Current-epoch counter is untouched.
        assert_eq!(inp.half.seq, [0u8; 8]);
    }

    #[test]
    fn test_skip_packet_truncated() {
        let conn = conn_for_test();
        let mut inp = half_in();
        let mut packet = packet_with_record(0, 0, 10);
        packet.truncate(packet.len() - 1);
        assert!(conn.skip_packet(&mut inp, &packet).is_err());
    }
}
