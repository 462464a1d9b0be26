use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Machine-readable error codes, grouped per toolchain stage.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum Errc {
	// Generator
	#[error("GNR_INVALID_IDENTIFIER")]
	GnrInvalidIdentifier,
	#[error("GNR_PARAMETER_OVERFLOW")]
	GnrParameterOverflow,
	#[error("GNR_INITIALIZER_OVERFLOW")]
	GnrInitializerOverflow,
	#[error("GNR_INDEX_OUT_OF_RANGE")]
	GnrIndexOutOfRange,
	#[error("GNR_ARRAY_LENGTH_ZERO")]
	GnrArrayLengthZero,
	#[error("GNR_INVALID_INDEX")]
	GnrInvalidIndex,
	#[error("GNR_EMPTY_OFFSET")]
	GnrEmptyOffset,
	#[error("GNR_IDENTIFIER_TYPE_MISMATCH")]
	GnrIdentifierTypeMismatch,
	#[error("GNR_INVALID_VOID_TYPE")]
	GnrInvalidVoidType,
	#[error("GNR_TYPE_REDECLARATION")]
	GnrTypeRedeclaration,
	#[error("GNR_METHOD_REDECLARATION")]
	GnrMethodRedeclaration,
	#[error("GNR_GLOBAL_REDECLARATION")]
	GnrGlobalRedeclaration,
	#[error("GNR_FIELD_REDECLARATION")]
	GnrFieldRedeclaration,
	#[error("GNR_STACK_REDECLARATION")]
	GnrStackRedeclaration,
	#[error("GNR_LABEL_REDECLARATION")]
	GnrLabelRedeclaration,
	#[error("GNR_LABEL_UNDEFINED")]
	GnrLabelUndefined,
	#[error("GNR_INVALID_RET_VAL")]
	GnrInvalidRetVal,
	#[error("GNR_MISSING_RET_VAL")]
	GnrMissingRetVal,
	#[error("GNR_STACK_OUT_OF_RANGE")]
	GnrStackOutOfRange,
	#[error("GNR_PARAM_OUT_OF_RANGE")]
	GnrParamOutOfRange,
	#[error("GNR_INVALID_CONSTANT")]
	GnrInvalidConstant,
	#[error("GNR_INVALID_CONSTANT_ADDR")]
	GnrInvalidConstantAddr,

	// Linker
	#[error("LNK_INVALID_INTERMEDIATE")]
	LnkInvalidIntermediate,
	#[error("LNK_INCOMPATIBLE_INTERMEDIATE")]
	LnkIncompatibleIntermediate,
	#[error("LNK_RECURSIVE_TYPE_DEFINITION")]
	LnkRecursiveTypeDefinition,
	#[error("LNK_UNDEFINED_TYPE")]
	LnkUndefinedType,
	#[error("LNK_UNDEFINED_METHOD")]
	LnkUndefinedMethod,
	#[error("LNK_UNDEFINED_GLOBAL")]
	LnkUndefinedGlobal,
	#[error("LNK_UNDEFINED_TYPE_FIELD")]
	LnkUndefinedTypeField,
	#[error("LNK_TYPE_SIZE_ZERO")]
	LnkTypeSizeZero,
	#[error("LNK_UNINITIALIZED_METHOD_PTR")]
	LnkUninitializedMethodPtr,
	#[error("LNK_UNDEFINED_METHOD_INITIALIZER")]
	LnkUndefinedMethodInitializer,
	#[error("LNK_INVALID_METHOD_INITIALIZER")]
	LnkInvalidMethodInitializer,
	#[error("LNK_GLOBAL_INITIALIZER_OVERFLOW")]
	LnkGlobalInitializerOverflow,
	#[error("LNK_INVALID_IMPLICIT_CONVERSION")]
	LnkInvalidImplicitConversion,
	#[error("LNK_INVALID_EXPLICIT_CONVERSION")]
	LnkInvalidExplicitConversion,
	#[error("LNK_INVALID_ARITHMETIC_EXPRESSION")]
	LnkInvalidArithmeticExpression,
	#[error("LNK_INVALID_COMPARISON_EXPRESSION")]
	LnkInvalidComparisonExpression,
	#[error("LNK_INVALID_POINTER_EXPRESSION")]
	LnkInvalidPointerExpression,
	#[error("LNK_INVALID_PTR_OFFSET_EXPRESSION")]
	LnkInvalidPtrOffsetExpression,
	#[error("LNK_INVALID_SWITCH_TYPE")]
	LnkInvalidSwitchType,
	#[error("LNK_FUNCTION_ARGUMENT_COUNT_MISMATCH")]
	LnkFunctionArgumentCountMismatch,
	#[error("LNK_NON_SIGNATURE_TYPE_INVOKE")]
	LnkNonSignatureTypeInvoke,
	#[error("LNK_INVALID_RETURN_ADDRESS")]
	LnkInvalidReturnAddress,
	#[error("LNK_ARRAY_INDEX_OUT_OF_RANGE")]
	LnkArrayIndexOutOfRange,
	#[error("LNK_INVALID_OFFSET_MODIFIER")]
	LnkInvalidOffsetModifier,
	#[error("LNK_FIELD_PARENT_TYPE_MISMATCH")]
	LnkFieldParentTypeMismatch,
	#[error("LNK_INVALID_POINTER_DEREFERENCE")]
	LnkInvalidPointerDereference,
	#[error("LNK_ABSTRACT_POINTER_DEREFERENCE")]
	LnkAbstractPointerDereference,
	#[error("LNK_INVALID_FIELD_DEREFERENCE")]
	LnkInvalidFieldDereference,

	// Runtime
	#[error("RTM_INVALID_ASSEMBLY")]
	RtmInvalidAssembly,
	#[error("RTM_INCOMPATIBLE_ASSEMBLY")]
	RtmIncompatibleAssembly,
	#[error("RTM_ENTRYPOINT_NOT_FOUND")]
	RtmEntrypointNotFound,
	#[error("RTM_STACK_ALLOCATION_FAILURE")]
	RtmStackAllocationFailure,
	#[error("RTM_STACK_OVERFLOW")]
	RtmStackOverflow,
	#[error("RTM_CALLSTACK_LIMIT_REACHED")]
	RtmCallstackLimitReached,
	#[error("RTM_RUNTIME_HASH_MISMATCH")]
	RtmRuntimeHashMismatch,
	#[error("RTM_INVALID_METHOD_POINTER")]
	RtmInvalidMethodPointer,
	#[error("RTM_MALFORMED_BYTECODE")]
	RtmMalformedBytecode,
	#[error("RTM_EXTERNAL_CALL_FAILURE")]
	RtmExternalCallFailure,
}

/// Source location attached to generator errors.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FileMeta {
	pub file_name: String,
	pub line_number: u32,
}

impl Display for FileMeta {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let name = match self.file_name.is_empty() {
			true => "<unknown>",
			false => self.file_name.as_str(),
		};
		write!(f, "{}:{}", name, self.line_number)
	}
}

#[derive(Debug, Clone)]
pub struct Error {
	pub code: Errc,
	pub message: String,
	pub meta: Option<FileMeta>,
}

impl Display for Error {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{}] {}", self.code, self.message)?;
		if let Some(meta) = &self.meta {
			write!(f, " ({meta})")?;
		}
		Ok(())
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(&self.code)
	}
}

impl Error {
	pub fn new(code: Errc, message: impl Into<String>) -> Self {
		Self { code, message: message.into(), meta: None }
	}

	pub fn with_meta(code: Errc, message: impl Into<String>, meta: FileMeta) -> Self {
		Self { code, message: message.into(), meta: Some(meta) }
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_display_includes_code_and_meta() {
		let err = Error::with_meta(
			Errc::GnrInvalidIdentifier,
			"invalid identifier: '3x'",
			FileMeta { file_name: "test.ptf".into(), line_number: 12 },
		);
		let text = err.to_string();
		assert!(text.contains("GNR_INVALID_IDENTIFIER"));
		assert!(text.contains("test.ptf:12"));
	}
}
