//! InfluxQL subset: lexer, syntax tree and parser

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{
    BinaryOp, Dimension, Expr, Field, Fill, Measurement, RetentionPolicyDef, SelectStatement,
    Statement,
};
pub use parser::{parse_expr, parse_query, parse_statement};
