//! Constraining and enumerating the passphrase on a found state.

use crate::error::*;
use crate::machine;
use falcon::il;
use falcon_z3::il::solve;
use finch::executor::State;

/// Constrain `length` bytes at `address` to printable, non-space ASCII.
pub fn constrain_printable(state: &mut State, address: u64, length: usize) -> Result<()> {
    for byte in machine::read_bytes(state, address, length as u64)? {
        state.add_path_constraint(&il::Expression::cmpltu(
            il::expr_const(0x20, 8),
            byte.clone(),
        )?)?;
        state.add_path_constraint(&il::Expression::cmpltu(byte, il::expr_const(0x7f, 8))?)?;
    }
    Ok(())
}

/// Up to `limit` distinct values of `expression` under the state's path
/// constraints, in the order the solver hands them out.
///
/// Every solution found is excluded from the next query. When there are more
/// than `limit` solutions, the rest are dropped with a warning.
pub fn any_n(state: &State, expression: &il::Expression, limit: usize) -> Result<Vec<il::Constant>> {
    let expression = state.symbolize_expression(expression)?;

    if expression.all_constants() {
        return Ok(vec![falcon::executor::eval(&expression)?]);
    }

    let mut constraints = state.path_constraints();
    let mut solutions = Vec::new();

    while solutions.len() < limit {
        let solution = match solve(&constraints, &expression)? {
            Some(solution) => solution,
            None => return Ok(solutions),
        };
        constraints.push(il::Expression::cmpneq(
            expression.clone(),
            solution.clone().into(),
        )?);
        solutions.push(solution);
    }

    if solve(&constraints, &expression)?.is_some() {
        warn!(
            "More than {} solutions for {}, the rest are dropped",
            limit, expression
        );
    }

    Ok(solutions)
}

/// The bytes of `bytes` read as one big-endian value, so that solutions
/// render back in memory order.
fn concat(bytes: Vec<il::Expression>) -> Result<il::Expression> {
    let bits = bytes.len() * 8;
    let mut bytes = bytes.into_iter();
    let first = bytes.next().ok_or("Can not concatenate zero bytes")?;

    if bits == 8 {
        return Ok(first);
    }

    let mut value = il::Expression::zext(bits, first)?;
    for byte in bytes {
        value = il::Expression::or(
            il::Expression::shl(value, il::expr_const(8, bits))?,
            il::Expression::zext(bits, byte)?,
        )?;
    }
    Ok(value)
}

/// For each `chunk`-byte window of the `length` bytes at `address`, every
/// value the window may take, up to `limit` per window.
pub fn byte_pair_candidates(
    state: &State,
    address: u64,
    length: usize,
    chunk: usize,
    limit: usize,
) -> Result<Vec<Vec<Vec<u8>>>> {
    if chunk == 0 || chunk > 8 {
        bail!("Windows of {} bytes are not supported", chunk);
    }

    let mut candidates = Vec::new();

    for offset in (0..length).step_by(chunk) {
        let width = chunk.min(length - offset);
        let bytes = machine::read_bytes(state, address + offset as u64, width as u64)?;
        let window = concat(bytes)?;

        let values = any_n(state, &window, limit)?
            .into_iter()
            .map(|value| {
                let value = value
                    .value_u64()
                    .ok_or_else(|| Error::from(ErrorKind::Unconcretizable(format!("{}", window))))?;
                Ok((0..width)
                    .map(|i| (value >> (8 * (width - 1 - i))) as u8)
                    .collect::<Vec<u8>>())
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;

        debug!(
            "{} candidates for 0x{:x}..0x{:x}",
            values.len(),
            address + offset as u64,
            address + (offset + width) as u64
        );

        candidates.push(values);
    }

    Ok(candidates)
}
